//! Runs every source adapter in isolation and collects candidates and failures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aot_adapters::{AdapterContext, SourceAdapter};
use aot_core::RawCandidate;
use aot_storage::HttpFetcher;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Ok { candidates: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    #[serde(flatten)]
    pub status: SourceStatus,
    pub elapsed_ms: u64,
}

impl SourceOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, SourceStatus::Failed { .. })
    }
}

#[derive(Debug, Default)]
pub struct OrchestratorOutcome {
    /// Grouped by source, sources in ascending `source_id` order.
    pub candidates: Vec<RawCandidate>,
    pub outcomes: Vec<SourceOutcome>,
}

impl OrchestratorOutcome {
    /// `(source_id, reason)` for every failed source.
    pub fn failed_sources(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.status {
                SourceStatus::Failed { reason } => Some((o.source_id.as_str(), reason.as_str())),
                SourceStatus::Ok { .. } => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SourceOrchestrator {
    http: Arc<HttpFetcher>,
    max_parallel: usize,
    source_timeout: Duration,
}

type TaskResult = (String, Result<Vec<RawCandidate>, String>, Duration);

impl SourceOrchestrator {
    pub fn new(http: Arc<HttpFetcher>, max_parallel: usize, source_timeout: Duration) -> Self {
        Self {
            http,
            max_parallel: max_parallel.max(1),
            source_timeout,
        }
    }

    pub async fn run(&self, adapters: &[Arc<dyn SourceAdapter>], ctx: &AdapterContext) -> OrchestratorOutcome {
        let limit = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        for adapter in adapters {
            let adapter = Arc::clone(adapter);
            let http = Arc::clone(&self.http);
            let ctx = ctx.clone();
            let limit = Arc::clone(&limit);
            let timeout = self.source_timeout;
            let source_id = adapter.source_id().to_string();
            let span = info_span!("source", source_id = %source_id);

            tasks.spawn(
                async move {
                    let _permit = limit.acquire_owned().await.ok();
                    let started = Instant::now();
                    info!("source started");

                    // Inner task so a panicking adapter surfaces as a JoinError.
                    let mut fetch = tokio::spawn(async move { adapter.fetch(&http, &ctx).await });
                    let result = match tokio::time::timeout(timeout, &mut fetch).await {
                        Ok(Ok(Ok(candidates))) => Ok(candidates),
                        Ok(Ok(Err(err))) => Err(err.to_string()),
                        Ok(Err(join_err)) if join_err.is_panic() => Err("adapter panicked".to_string()),
                        Ok(Err(join_err)) => Err(format!("adapter task failed: {join_err}")),
                        Err(_) => {
                            fetch.abort();
                            Err(format!("timed out after {}s", timeout.as_secs()))
                        }
                    };
                    (source_id, result, started.elapsed())
                }
                .instrument(span),
            );
        }

        let mut by_source: BTreeMap<String, (Result<Vec<RawCandidate>, String>, Duration)> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((source_id, result, elapsed)) => {
                    by_source.insert(source_id, (result, elapsed));
                }
                Err(err) => error!(error = %err, "source task lost"),
            }
        }

        let mut outcome = OrchestratorOutcome::default();
        for (source_id, (result, elapsed)) in by_source {
            let elapsed_ms = elapsed.as_millis() as u64;
            let status = match result {
                Ok(mut candidates) => {
                    for candidate in &mut candidates {
                        candidate.source_id.clone_from(&source_id);
                    }
                    info!(source_id = %source_id, count = candidates.len(), elapsed_ms, "source finished");
                    let count = candidates.len();
                    outcome.candidates.extend(candidates);
                    SourceStatus::Ok { candidates: count }
                }
                Err(reason) => {
                    warn!(source_id = %source_id, reason = %reason, elapsed_ms, "source failed");
                    SourceStatus::Failed { reason }
                }
            };
            outcome.outcomes.push(SourceOutcome {
                source_id,
                status,
                elapsed_ms,
            });
        }
        outcome
    }
}
