//! HTTP fetch utilities and the durable opportunity store for AOT.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use aot_core::{IdentityKey, MergePlan, Opportunity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aot-storage";

pub const STORE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub global_concurrency: usize,
    /// Minimum spacing between two requests against the same source.
    pub per_source_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            accept_language: Some("es-CO,es;q=0.9,en;q=0.8".to_string()),
            global_concurrency: 8,
            per_source_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

/// Shared HTTP client. One attempt per request; sources are not retried within a run.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        if let Some(lang) = &config.accept_language {
            headers.insert(
                ACCEPT_LANGUAGE,
                HeaderValue::from_str(lang).context("invalid accept-language header")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_interval: config.per_source_interval,
            next_slot: Mutex::new(HashMap::new()),
        })
    }

    /// Reserve the next request slot for `source_id` and sleep until it opens.
    async fn pace(&self, source_id: &str) {
        let wait = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots.get(source_id).copied().filter(|s| *s > now).unwrap_or(now);
            slots.insert(source_id.to_string(), slot + self.per_source_interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.pace(source_id).await;
        let _permit = self.global_limit.acquire().await.ok();

        let span = info_span!("http_fetch", source_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), %status, "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(source_id, url).await?.text())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store document {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing store document: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("store schema version {found} is not supported (expected {STORE_SCHEMA_VERSION})")]
    SchemaVersion { found: u32 },
    #[error("merge plan conflicts with stored records: {0}")]
    Conflict(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDocument {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub opportunities: Vec<Opportunity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCommit {
    pub inserted: usize,
    pub updated: usize,
    pub total: usize,
}

/// Durable record set keyed by identity. `apply` is all-or-nothing.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn load(&self) -> Result<Vec<Opportunity>, StoreError>;
    async fn apply(&self, plan: &MergePlan) -> Result<StoreCommit, StoreError>;
}

/// Apply a merge plan to an in-memory record set, validating identity uniqueness.
pub fn apply_plan(records: Vec<Opportunity>, plan: &MergePlan) -> Result<Vec<Opportunity>, StoreError> {
    let mut records = records;
    let mut index: BTreeMap<IdentityKey, usize> = BTreeMap::new();
    for (pos, record) in records.iter().enumerate() {
        if let Ok(key) = record.identity_key() {
            index.entry(key).or_insert(pos);
        }
    }

    for update in &plan.updates {
        let Some(&pos) = index.get(&update.key) else {
            return Err(StoreError::Conflict(format!(
                "update targets unknown record {}",
                update.key
            )));
        };
        match update.record.identity_key() {
            Ok(key) if key == update.key => {}
            _ => {
                return Err(StoreError::Conflict(format!(
                    "update for {} changes the record identity",
                    update.key
                )))
            }
        }
        records[pos] = update.record.clone();
    }

    for insert in &plan.inserts {
        let key = insert.identity_key().map_err(|reason| {
            StoreError::Conflict(format!("insert `{}` has no identity: {reason}", insert.name))
        })?;
        if index.contains_key(&key) {
            return Err(StoreError::Conflict(format!("insert duplicates existing record {key}")));
        }
        index.insert(key, records.len());
        records.push(insert.clone());
    }

    sort_by_closing_date(&mut records);
    Ok(records)
}

/// Closing date ascending, unknown dates last; stable for equal dates.
pub fn sort_by_closing_date(records: &mut [Opportunity]) {
    records.sort_by_key(|r| (r.closing_date.value.is_none(), r.closing_date.value));
}

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Write the whole document to a temp file and rename it over the store.
    async fn write_atomic(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .map_err(|e| self.io_error(parent, e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(self.io_error(&self.path, err));
        }
        Ok(())
    }
}

#[async_trait]
impl OpportunityStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<Opportunity>, StoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "store not found; starting empty");
                return Ok(Vec::new());
            }
            Err(err) => return Err(self.io_error(&self.path, err)),
        };
        let doc: StoreDocument = serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        if doc.schema_version != STORE_SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion {
                found: doc.schema_version,
            });
        }
        Ok(doc.opportunities)
    }

    async fn apply(&self, plan: &MergePlan) -> Result<StoreCommit, StoreError> {
        let current = self.load().await?;
        let merged = apply_plan(current, plan)?;
        let doc = StoreDocument {
            schema_version: STORE_SCHEMA_VERSION,
            saved_at: Utc::now(),
            opportunities: merged,
        };
        let bytes = serde_json::to_vec_pretty(&doc).map_err(StoreError::Serialize)?;
        self.write_atomic(&bytes).await.inspect_err(|err| {
            warn!(error = %err, "store write failed; previous contents kept");
        })?;

        let commit = StoreCommit {
            inserted: plan.inserts.len(),
            updated: plan.updates.len(),
            total: doc.opportunities.len(),
        };
        info!(
            path = %self.path.display(),
            inserted = commit.inserted,
            updated = commit.updated,
            total = commit.total,
            "store committed"
        );
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aot_core::{
        Attribution, Field, FieldChange, OpportunityState, RecordUpdate, RelevanceTier, Tracked,
        TrackedField,
    };
    use chrono::NaiveDate;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(name: &str, closing: Option<NaiveDate>) -> Opportunity {
        let seen = date(2025, 1, 1);
        Opportunity {
            name: name.to_string(),
            entity: "ICETEX".to_string(),
            description: Field::empty(),
            category: Field::empty(),
            areas: BTreeSet::new(),
            opening_date: Field::empty(),
            closing_date: Field::from_option(closing, Attribution::automated("icetex", seen)),
            amount: Field::empty(),
            source_url: Field::empty(),
            requirements: Field::empty(),
            required_documents: Field::empty(),
            notes: Field::empty(),
            source_portals: ["icetex".to_string()].into_iter().collect(),
            relevance: RelevanceTier::Medium,
            state: Tracked::new(OpportunityState::New, Attribution::engine(seen)),
            first_seen: seen,
            last_seen: seen,
            past_due_noted: None,
        }
    }

    #[tokio::test]
    async fn missing_store_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("data/opportunities.json"));
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn apply_round_trips_overrides_and_sorts_by_closing_date() {
        let dir = tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("data/opportunities.json"));

        let mut applied = record("Beca Aplicada", Some(date(2025, 6, 1)));
        applied.state = Tracked::new(OpportunityState::Applied, Attribution::human(date(2025, 2, 1)));
        let mut plan = MergePlan::new(date(2025, 2, 1));
        plan.inserts = vec![
            record("Sin fecha", None),
            applied.clone(),
            record("Cierra pronto", Some(date(2025, 3, 1))),
        ];

        let commit = store.apply(&plan).await.expect("apply");
        assert_eq!(commit.inserted, 3);
        assert_eq!(commit.total, 3);

        let loaded = store.load().await.expect("load");
        let names: Vec<_> = loaded.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Cierra pronto", "Beca Aplicada", "Sin fecha"]);
        assert_eq!(loaded[1], applied);
        assert!(loaded[1].has_state_override());
    }

    #[tokio::test]
    async fn conflicting_plan_leaves_store_untouched() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("opportunities.json");
        let store = JsonFileStore::new(&path);

        let mut seed = MergePlan::new(date(2025, 1, 1));
        seed.inserts = vec![record("Beca ICETEX 2025", Some(date(2025, 5, 1)))];
        store.apply(&seed).await.expect("seed");
        let before = std::fs::read(&path).expect("read before");

        let mut bad = MergePlan::new(date(2025, 2, 1));
        bad.inserts = vec![record("Otra beca", None)];
        bad.updates = vec![RecordUpdate {
            key: IdentityKey::new("No existe", "ICETEX").unwrap(),
            record: record("No existe", None),
            changes: vec![FieldChange {
                field: TrackedField::LastSeen,
                before: None,
                after: None,
                attribution: Attribution::engine(date(2025, 2, 1)),
            }],
        }];
        let err = store.apply(&bad).await.expect_err("conflict");
        assert!(matches!(err, StoreError::Conflict(_)));

        let after = std::fs::read(&path).expect("read after");
        assert_eq!(before, after);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let existing = vec![record("Beca ICETEX 2025", None)];
        let mut plan = MergePlan::new(date(2025, 1, 1));
        plan.inserts = vec![record("beca  icetex 2025", None)];
        assert!(matches!(apply_plan(existing, &plan), Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn unsupported_schema_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("opportunities.json");
        std::fs::write(
            &path,
            r#"{"schema_version": 99, "saved_at": "2025-01-01T00:00:00Z", "opportunities": []}"#,
        )
        .expect("write");
        let err = JsonFileStore::new(&path).load().await.expect_err("schema");
        assert!(matches!(err, StoreError::SchemaVersion { found: 99 }));
    }

    #[tokio::test]
    async fn pacing_spaces_requests_per_source() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            per_source_interval: Duration::from_millis(40),
            ..Default::default()
        })
        .expect("fetcher");
        let started = Instant::now();
        fetcher.pace("icetex").await;
        fetcher.pace("icetex").await;
        fetcher.pace("minciencias").await;
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(started.elapsed() < Duration::from_millis(1000));
    }
}
