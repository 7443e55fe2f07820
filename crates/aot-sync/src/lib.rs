//! Run pipeline: scrape, consolidate, apply, report, export and notify.

pub mod config;
pub mod consolidate;
pub mod edits;
pub mod export;
pub mod fill;
pub mod lifecycle;
pub mod notify;
pub mod orchestrator;
pub mod report;
pub mod scoring;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aot_adapters::{build_adapters, AdapterContext, FieldExtractor, PatternExtractor, SourceAdapter};
use aot_core::RawCandidate;
use aot_storage::{HttpClientConfig, HttpFetcher, JsonFileStore, OpportunityStore, StoreCommit, StoreError};
use chrono::{Local, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{AcademicProfile, EngineConfig, ScoringConfig, ScoringWeights, SourceRegistry, SyncConfig};
pub use consolidate::{ConsolidationEngine, ConsolidationOutcome};
pub use edits::{EditError, HumanEdit};
pub use lifecycle::TransitionError;
pub use notify::{LogNotifier, Notification, Notifier, OutboxNotifier};
pub use orchestrator::{SourceOrchestrator, SourceOutcome, SourceStatus};
pub use report::RunReport;
pub use scoring::RelevanceScorer;

pub const CRATE_NAME: &str = "aot-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Scrape, consolidate, report and notify.
    Full,
    /// Same as `Full` without the notification.
    ScrapeOnly,
    /// No scraping: rescore and re-evaluate the stored records only.
    Resync,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::ScrapeOnly => "scrape_only",
            RunMode::Resync => "resync",
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Edit(#[from] EditError),
    #[error("pipeline setup failed: {0:#}")]
    Setup(anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub mode: RunMode,
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub candidates: usize,
    pub inserted: usize,
    pub updated: usize,
    pub expired: usize,
    pub total: usize,
    pub report_dir: Option<PathBuf>,
    pub snapshot_manifest: Option<PathBuf>,
    pub notified: bool,
}

pub struct SyncPipeline {
    config: SyncConfig,
    engine_config: Arc<EngineConfig>,
    http: Arc<HttpFetcher>,
    store: Arc<dyn OpportunityStore>,
    notifier: Arc<dyn Notifier>,
    extractor: Arc<dyn FieldExtractor>,
    adapters: Option<Vec<Arc<dyn SourceAdapter>>>,
}

impl SyncPipeline {
    /// Infrastructure only; adapters are built from `sources.yaml` on the first
    /// scraping run unless supplied with `with_sources` or `with_adapters`.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let mut engine_config = EngineConfig::load_or_default(&config.profile_path())?;
        if let Some(days) = config.expiry_warning_days {
            engine_config.expiry_warning_days = days;
            engine_config.validate()?;
        }
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })
        .map_err(SyncError::Setup)?;
        let store = JsonFileStore::new(config.store_path.clone());
        let notifier = OutboxNotifier::new(config.outbox_dir.clone(), config.notify_recipient.clone());

        Ok(Self {
            engine_config: Arc::new(engine_config),
            http: Arc::new(http),
            store: Arc::new(store),
            notifier: Arc::new(notifier),
            extractor: Arc::new(PatternExtractor),
            adapters: None,
            config,
        })
    }

    pub fn with_sources(mut self, registry: &SourceRegistry) -> Result<Self, SyncError> {
        let adapters = build_adapters(&registry.sources, &self.config.workspace_root)
            .map_err(|e| SyncError::Config(e.to_string()))?;
        self.adapters = Some(adapters);
        Ok(self)
    }

    pub fn with_adapters(mut self, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        self.adapters = Some(adapters);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn OpportunityStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_engine_config(mut self, engine_config: EngineConfig) -> Result<Self, SyncError> {
        engine_config.validate()?;
        self.engine_config = Arc::new(engine_config);
        Ok(self)
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine_config
    }

    pub fn run_date(&self) -> NaiveDate {
        self.config.run_date.unwrap_or_else(|| Local::now().date_naive())
    }

    fn resolve_adapters(&self) -> Result<Vec<Arc<dyn SourceAdapter>>, SyncError> {
        if let Some(adapters) = &self.adapters {
            return Ok(adapters.clone());
        }
        let registry = SourceRegistry::load(&self.config.sources_path())?;
        build_adapters(&registry.sources, &self.config.workspace_root).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let run_date = self.run_date();
        let span = info_span!("run", run_id = %run_id, mode = mode.as_str(), run_date = %run_date);
        self.run_inner(run_id, run_date, mode).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, run_date: NaiveDate, mode: RunMode) -> Result<RunSummary, SyncError> {
        // Adapter configuration errors surface before anything is fetched.
        let adapters = match mode {
            RunMode::Resync => Vec::new(),
            RunMode::Full | RunMode::ScrapeOnly => self.resolve_adapters()?,
        };

        let existing = self.store.load().await?;
        info!(stored = existing.len(), sources = adapters.len(), "run started");

        let (candidates, outcomes) = if adapters.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            self.scrape(&adapters).await
        };
        let candidate_count = candidates.len();

        let engine = ConsolidationEngine::new(Arc::clone(&self.engine_config));
        let consolidation = engine.consolidate(candidates, &existing, run_date);
        let commit = self.store.apply(&consolidation.plan).await?;
        let records = self.store.load().await?;

        let report = report::build_report(report::ReportInput {
            run_id,
            run_date,
            mode,
            expiry_warning_days: self.engine_config.expiry_warning_days,
            records: &records,
            consolidation: &consolidation,
            sources: &outcomes,
        });

        let report_dir = match report::write_report(&self.config.reports_dir, &report).await {
            Ok(dir) => Some(dir),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "writing report failed");
                None
            }
        };

        let snapshot_dir = report::report_dir_for(&self.config.reports_dir, &report);
        let snapshot_manifest = match export::export_snapshot(&snapshot_dir, run_id, &records).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "snapshot export failed");
                None
            }
        };

        let notified = if mode == RunMode::Full {
            self.notify(&report).await
        } else {
            false
        };

        let summary = RunSummary {
            run_id,
            run_date,
            mode,
            sources_ok: outcomes.iter().filter(|o| !o.is_failure()).count(),
            sources_failed: outcomes.iter().filter(|o| o.is_failure()).count(),
            candidates: candidate_count,
            inserted: commit.inserted,
            updated: commit.updated,
            expired: consolidation.expired.len(),
            total: commit.total,
            report_dir,
            snapshot_manifest,
            notified,
        };
        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            expired = summary.expired,
            failed_sources = summary.sources_failed,
            "run finished"
        );
        Ok(summary)
    }

    async fn scrape(&self, adapters: &[Arc<dyn SourceAdapter>]) -> (Vec<RawCandidate>, Vec<SourceOutcome>) {
        let orchestrator = SourceOrchestrator::new(
            Arc::clone(&self.http),
            self.config.max_parallel_sources,
            Duration::from_secs(self.config.source_timeout_secs),
        );
        let ctx = AdapterContext {
            fetched_at: Utc::now(),
            fetch_details: self.config.fetch_details,
        };
        let outcome = orchestrator.run(adapters, &ctx).await;
        let mut candidates = outcome.candidates;
        fill::fill_candidates(self.extractor.as_ref(), &mut candidates);
        (candidates, outcome.outcomes)
    }

    async fn notify(&self, report: &RunReport) -> bool {
        let notification = Notification {
            run_id: report.run_id,
            subject: report::subject(report),
            body: report::render_markdown(report),
        };
        match self.notifier.deliver(&notification).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "notification failed; store update kept");
                false
            }
        }
    }

    /// Apply one human edit to the store.
    pub async fn apply_human_edit(&self, edit: &HumanEdit) -> Result<StoreCommit, SyncError> {
        let run_date = self.run_date();
        let records = self.store.load().await?;
        let plan = edits::plan_edit(edit, &records, run_date)?;
        if plan.is_empty() {
            info!("edit changes nothing");
        }
        Ok(self.store.apply(&plan).await?)
    }
}
