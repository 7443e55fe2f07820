//! Source adapter contract, portal adapters and the adapter registry.

pub mod extract;
pub mod listing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aot_core::{Amount, Category, RawCandidate};
use aot_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub use extract::{Extracted, FieldExtractor, PatternExtractor};
pub use listing::{ListingLayout, LinkScan};

pub const CRATE_NAME: &str = "aot-adapters";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub fetched_at: DateTime<Utc>,
    /// Follow each candidate's link and append the page text to its context.
    pub fetch_details: bool,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One portal. Failures stay inside the returned `Result`; the orchestrator
/// turns them into per-source failure records.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawCandidate>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Web,
    Manual,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
}

fn default_true() -> bool {
    true
}

impl SourceSpec {
    fn entity_or(&self, fallback: &str) -> String {
        self.entity.clone().unwrap_or_else(|| fallback.to_string())
    }

    fn require_listing_url(&self) -> Result<String, AdapterError> {
        self.listing_url
            .clone()
            .ok_or_else(|| AdapterError::Config(format!("source `{}` has no listing_url", self.source_id)))
    }
}

const ICETEX_FALLBACK: &[&str] = &["beca", "scholarship", "convocatoria"];
const MINCIENCIAS_FALLBACK: &[&str] = &["convocatoria"];
const FULBRIGHT_FALLBACK: &[&str] = &["beca", "scholarship", "program", "grant"];
const UNIVALLE_FALLBACK: &[&str] = &[
    "convocatoria",
    "beca",
    "movilidad",
    "estancia",
    "pasantia",
    "investigacion",
    "extension",
];

fn portal_scan(keywords: &'static [&'static str], min_chars: usize) -> LinkScan {
    LinkScan {
        keywords,
        min_chars,
        strict: false,
        limit: Some(listing::MAX_ITEMS_PER_LISTING),
    }
}

/// Listing layout for portals with a dedicated adapter.
pub fn portal_layout(spec: &SourceSpec) -> Option<ListingLayout> {
    let id = spec.source_id.to_ascii_lowercase();
    let layout = match id.as_str() {
        "icetex" => ListingLayout {
            entity: spec.entity_or("ICETEX"),
            category: spec.category.unwrap_or(Category::Scholarship),
            item_selectors: &[
                ".card",
                ".accordion-item",
                "article",
                ".beca-item",
                ".views-row",
                "div[class*='beca']",
                "li.list-group-item",
            ],
            title_selector: "h2, h3, h4, .card-title, .accordion-header, .card-header, a[class*='title']",
            min_items: 1,
            min_title_chars: 5,
            read_badges: false,
            detail_pages: false,
            fallback: portal_scan(ICETEX_FALLBACK, 1),
        },
        "minciencias" => ListingLayout {
            entity: spec.entity_or("Minciencias"),
            category: spec.category.unwrap_or(Category::CallForProposals),
            item_selectors: &[
                "article",
                ".views-row",
                ".card",
                ".node--type-convocatoria",
                ".view-content .item-list li",
                "div.convocatoria",
            ],
            title_selector: "h2 a, h3 a, .title a, .field--name-title a, a",
            min_items: 1,
            min_title_chars: 5,
            read_badges: true,
            detail_pages: true,
            fallback: portal_scan(MINCIENCIAS_FALLBACK, 1),
        },
        "fulbright" => ListingLayout {
            entity: spec.entity_or("Fulbright Colombia"),
            category: spec.category.unwrap_or(Category::Scholarship),
            item_selectors: &[
                "article",
                ".program-card",
                ".beca-card",
                ".card",
                ".elementor-widget-container",
                "div[class*='program']",
            ],
            title_selector: "h2, h3, h4, .title, a",
            min_items: 2,
            min_title_chars: 10,
            read_badges: false,
            detail_pages: false,
            fallback: portal_scan(FULBRIGHT_FALLBACK, 11),
        },
        _ if id.starts_with("univalle") => {
            let url = spec.listing_url.as_deref().unwrap_or_default().to_ascii_lowercase();
            let (unit, category) = if url.contains("extension") || id.contains("extension") {
                ("Extension", Category::CallForProposals)
            } else if url.contains("investigacion") || id.contains("investigacion") {
                ("Investigaciones", Category::CallForProposals)
            } else {
                ("DGP", Category::Scholarship)
            };
            ListingLayout {
                entity: spec.entity_or(&format!("Universidad del Valle - {unit}")),
                category: spec.category.unwrap_or(category),
                item_selectors: &[
                    "article",
                    ".node",
                    ".views-row",
                    ".card",
                    "div[class*='convocatoria']",
                    "div[class*='noticia']",
                    ".elementor-post",
                    "li.list-group-item",
                ],
                title_selector: "h2 a, h3 a, h4 a, .title a, a.node-title, a",
                min_items: 2,
                min_title_chars: 8,
                read_badges: false,
                detail_pages: false,
                fallback: portal_scan(UNIVALLE_FALLBACK, 11),
            }
        }
        _ => return None,
    };
    Some(layout)
}

async fn append_detail_pages(http: &HttpFetcher, source_id: &str, candidates: &mut [RawCandidate]) {
    for candidate in candidates.iter_mut() {
        let Some(url) = candidate.source_url.clone() else {
            continue;
        };
        match http.fetch_text(source_id, &url).await {
            Ok(html) => {
                let text = listing::detail_text(&html);
                if !text.is_empty() {
                    candidate.context_text.push('\n');
                    candidate.context_text.push_str(&text);
                }
            }
            Err(err) => debug!(source_id, url = %url, error = %err, "detail page skipped"),
        }
    }
}

/// Adapter for a portal with a known listing layout.
#[derive(Debug, Clone)]
pub struct PortalAdapter {
    source_id: String,
    listing_url: String,
    layout: ListingLayout,
}

impl PortalAdapter {
    pub fn new(source_id: impl Into<String>, listing_url: impl Into<String>, layout: ListingLayout) -> Self {
        Self {
            source_id: source_id.into(),
            listing_url: listing_url.into(),
            layout,
        }
    }

    pub fn parse(&self, html: &str, fetched_at: DateTime<Utc>) -> Result<Vec<RawCandidate>, AdapterError> {
        listing::parse_listing(&self.layout, &self.source_id, html, &self.listing_url, fetched_at)
    }
}

#[async_trait]
impl SourceAdapter for PortalAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawCandidate>, AdapterError> {
        let html = http.fetch_text(&self.source_id, &self.listing_url).await?;
        let mut candidates = self.parse(&html, ctx.fetched_at)?;
        if ctx.fetch_details && self.layout.detail_pages {
            append_detail_pages(http, &self.source_id, &mut candidates).await;
        }
        info!(source_id = %self.source_id, count = candidates.len(), "listing parsed");
        Ok(candidates)
    }
}

/// Best-effort adapter for portals without a dedicated layout.
#[derive(Debug, Clone)]
pub struct GenericAdapter {
    source_id: String,
    listing_url: String,
    entity: String,
    category: Category,
    scan: LinkScan,
}

impl GenericAdapter {
    pub fn new(source_id: impl Into<String>, listing_url: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            listing_url: listing_url.into(),
            entity: entity.into(),
            category: Category::Other,
            scan: LinkScan::generic(),
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn parse(&self, html: &str, fetched_at: DateTime<Utc>) -> Result<Vec<RawCandidate>, AdapterError> {
        listing::scan_page(
            html,
            &self.scan,
            &self.listing_url,
            &self.source_id,
            &self.entity,
            self.category,
            fetched_at,
        )
    }
}

#[async_trait]
impl SourceAdapter for GenericAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawCandidate>, AdapterError> {
        let html = http.fetch_text(&self.source_id, &self.listing_url).await?;
        let mut candidates = self.parse(&html, ctx.fetched_at)?;
        if ctx.fetch_details {
            append_detail_pages(http, &self.source_id, &mut candidates).await;
        }
        info!(source_id = %self.source_id, count = candidates.len(), "link scan finished");
        Ok(candidates)
    }
}

/// One hand-curated posting in `manual/<source_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualEntry {
    pub name: String,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub areas: Vec<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub opening_date: Option<NaiveDate>,
    #[serde(default)]
    pub closing_date: Option<NaiveDate>,
    #[serde(default)]
    pub amount: Option<Amount>,
    #[serde(default)]
    pub requirements: Option<String>,
    #[serde(default)]
    pub required_documents: Option<String>,
}

/// Reads hand-curated postings from disk. Also used for the initial seed set.
#[derive(Debug, Clone)]
pub struct ManualAdapter {
    source_id: String,
    path: PathBuf,
    default_entity: String,
}

impl ManualAdapter {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>, default_entity: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            default_entity: default_entity.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self, fetched_at: DateTime<Utc>) -> Result<Vec<RawCandidate>, AdapterError> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AdapterError::Io {
                path: self.path.clone(),
                source,
            })?;
        let entries: Vec<ManualEntry> = serde_json::from_str(&data)
            .map_err(|e| AdapterError::Parse(format!("{}: {e}", self.path.display())))?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let entity = entry.entity.unwrap_or_else(|| self.default_entity.clone());
                let mut candidate = RawCandidate::new(&self.source_id, entry.name, entity, fetched_at);
                candidate.category = entry
                    .category
                    .unwrap_or_else(|| Category::infer(&candidate.name, Category::Other));
                candidate.context_text = entry.description.clone().unwrap_or_default();
                candidate.description = entry.description;
                candidate.areas = entry.areas;
                candidate.source_url = entry.source_url;
                candidate.opening_date = entry.opening_date;
                candidate.closing_date = entry.closing_date;
                candidate.amount = entry.amount;
                candidate.requirements = entry.requirements;
                candidate.required_documents = entry.required_documents;
                candidate
            })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for ManualAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, _http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawCandidate>, AdapterError> {
        let candidates = self.load(ctx.fetched_at).await?;
        info!(source_id = %self.source_id, path = %self.path.display(), count = candidates.len(), "manual entries loaded");
        Ok(candidates)
    }
}

/// Build the adapter for a configured source. Portals without a dedicated
/// layout get the generic fallback.
pub fn adapter_for_source(spec: &SourceSpec, workspace_root: &Path) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    match spec.mode {
        SourceMode::Manual => {
            let path = workspace_root.join("manual").join(format!("{}.json", spec.source_id));
            Ok(Arc::new(ManualAdapter::new(
                spec.source_id.clone(),
                path,
                spec.entity_or(&spec.display_name),
            )))
        }
        SourceMode::Web => {
            let listing_url = spec.require_listing_url()?;
            if let Some(layout) = portal_layout(spec) {
                return Ok(Arc::new(PortalAdapter::new(spec.source_id.clone(), listing_url, layout)));
            }
            let adapter = GenericAdapter::new(spec.source_id.clone(), listing_url, spec.entity_or(&spec.display_name))
                .with_category(spec.category.unwrap_or(Category::Other));
            Ok(Arc::new(adapter))
        }
    }
}

/// Adapters for every enabled source, in configuration order.
pub fn build_adapters(specs: &[SourceSpec], workspace_root: &Path) -> Result<Vec<Arc<dyn SourceAdapter>>, AdapterError> {
    specs
        .iter()
        .filter(|spec| spec.enabled)
        .map(|spec| adapter_for_source(spec, workspace_root))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_spec(source_id: &str, url: &str) -> SourceSpec {
        SourceSpec {
            source_id: source_id.to_string(),
            display_name: source_id.to_uppercase(),
            enabled: true,
            mode: SourceMode::Web,
            listing_url: Some(url.to_string()),
            entity: None,
            category: None,
        }
    }

    #[test]
    fn univalle_unit_is_detected_from_url() {
        let layout = portal_layout(&web_spec(
            "univalle_extension",
            "https://extension.univalle.edu.co/convocatorias",
        ))
        .unwrap();
        assert_eq!(layout.entity, "Universidad del Valle - Extension");
        assert_eq!(layout.category, Category::CallForProposals);

        let layout = portal_layout(&web_spec("univalle_dgp", "https://dgp.univalle.edu.co/becas")).unwrap();
        assert_eq!(layout.entity, "Universidad del Valle - DGP");
        assert_eq!(layout.category, Category::Scholarship);
    }

    #[test]
    fn unknown_portals_get_no_layout() {
        assert!(portal_layout(&web_spec("daad", "https://www.daad.co/es/")).is_none());
    }

    #[test]
    fn web_source_without_url_is_a_config_error() {
        let mut spec = web_spec("icetex", "https://web.icetex.gov.co/becas");
        spec.listing_url = None;
        let err = adapter_for_source(&spec, Path::new(".")).err().unwrap();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn disabled_sources_are_skipped() {
        let mut off = web_spec("daad", "https://www.daad.co/es/");
        off.enabled = false;
        let adapters = build_adapters(
            &[web_spec("icetex", "https://web.icetex.gov.co/becas"), off],
            Path::new("."),
        )
        .unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].source_id(), "icetex");
    }

    #[test]
    fn manual_source_reads_from_manual_dir() {
        let spec = SourceSpec {
            source_id: "seed".to_string(),
            display_name: "Seed".to_string(),
            enabled: true,
            mode: SourceMode::Manual,
            listing_url: None,
            entity: None,
            category: None,
        };
        let adapter = adapter_for_source(&spec, Path::new("/srv/aot")).unwrap();
        assert_eq!(adapter.source_id(), "seed");
    }

    #[tokio::test]
    async fn missing_manual_file_is_an_io_error() {
        let adapter = ManualAdapter::new("seed", "/nonexistent/aot/manual/seed.json", "Seleccion manual");
        let err = adapter.load(Utc::now()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Io { .. }));
    }
}
