//! Runtime configuration: environment, source registry and the academic profile.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use aot_adapters::SourceSpec;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::SyncError;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub store_path: PathBuf,
    pub reports_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_timeout_secs: u64,
    pub max_parallel_sources: usize,
    /// Overrides the profile's warning window when set.
    pub expiry_warning_days: Option<i64>,
    pub fetch_details: bool,
    pub run_date: Option<NaiveDate>,
    pub notify_recipient: Option<String>,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, SyncError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{name} has an invalid value `{raw}`"))),
        _ => Ok(None),
    }
}

impl SyncConfig {
    /// Defaults rooted at `root`; paths match what `from_env` uses when nothing is set.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            store_path: root.join("data").join("opportunities.json"),
            reports_dir: root.join("reports"),
            outbox_dir: root.join("outbox"),
            workspace_root: root,
            user_agent: format!("aot-bot/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 30,
            source_timeout_secs: 120,
            max_parallel_sources: 4,
            expiry_warning_days: None,
            fetch_details: true,
            run_date: None,
            notify_recipient: None,
        }
    }

    pub fn from_env() -> Result<Self, SyncError> {
        let root = std::env::var("AOT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let mut config = Self::for_workspace(&root);

        let under_root = |var: &str, fallback: PathBuf| {
            std::env::var(var)
                .map(|v| root.join(v))
                .unwrap_or(fallback)
        };
        config.store_path = under_root("AOT_STORE_PATH", config.store_path);
        config.reports_dir = under_root("AOT_REPORTS_DIR", config.reports_dir);
        config.outbox_dir = under_root("AOT_OUTBOX_DIR", config.outbox_dir);

        if let Ok(user_agent) = std::env::var("AOT_USER_AGENT") {
            config.user_agent = user_agent;
        }
        if let Some(secs) = env_parsed("AOT_HTTP_TIMEOUT_SECS")? {
            config.http_timeout_secs = secs;
        }
        if let Some(secs) = env_parsed("AOT_SOURCE_TIMEOUT_SECS")? {
            config.source_timeout_secs = secs;
        }
        if let Some(max) = env_parsed::<usize>("AOT_MAX_PARALLEL_SOURCES")? {
            config.max_parallel_sources = max.max(1);
        }
        config.expiry_warning_days = env_parsed("AOT_EXPIRY_WARNING_DAYS")?;
        config.fetch_details = env_flag("AOT_DETAIL_PAGES", true);
        config.run_date = env_parsed("AOT_RUN_DATE")?;
        config.notify_recipient = std::env::var("AOT_NOTIFY_RECIPIENT").ok().filter(|v| !v.trim().is_empty());
        Ok(config)
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn profile_path(&self) -> PathBuf {
        self.workspace_root.join("profile.yaml")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceSpec>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self, SyncError> {
        let registry: SourceRegistry =
            serde_yaml::from_str(text).map_err(|e| SyncError::Config(format!("parsing sources.yaml: {e}")))?;
        let mut seen = BTreeSet::new();
        for source in &registry.sources {
            if source.source_id.trim().is_empty() {
                return Err(SyncError::Config("sources.yaml has an entry without source_id".into()));
            }
            if !seen.insert(source.source_id.as_str()) {
                return Err(SyncError::Config(format!(
                    "sources.yaml lists `{}` more than once",
                    source.source_id
                )));
            }
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceSpec> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Who the tracker works for: terms are matched case- and accent-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcademicProfile {
    pub discipline: Vec<String>,
    pub areas: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub related_keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Area present as one of the record's tags.
    pub area_tag: u32,
    /// Area mentioned in the name or description.
    pub area_mention: u32,
    pub discipline: u32,
    pub keyword: u32,
    pub related_keyword: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            area_tag: 3,
            area_mention: 2,
            discipline: 4,
            keyword: 2,
            related_keyword: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub weights: ScoringWeights,
    pub strong_threshold: u32,
    pub weak_threshold: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            strong_threshold: 4,
            weak_threshold: 2,
        }
    }
}

fn default_warning_days() -> i64 {
    15
}

/// Immutable per-run configuration handed to the scorer and lifecycle rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub profile: AcademicProfile,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default = "default_warning_days")]
    pub expiry_warning_days: i64,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: AcademicProfile {
                discipline: strings(&["psicologia", "psychology"]),
                areas: strings(&[
                    "psicologia computacional",
                    "psicometria",
                    "filosofia de la ciencia",
                    "computational psychology",
                    "psychometrics",
                    "philosophy of science",
                    "ciencias cognitivas",
                    "cognitive science",
                ]),
                keywords: strings(&[
                    "doctorado",
                    "doctoral",
                    "phd",
                    "colombia",
                    "latinoamerica",
                    "latin america",
                    "iberoamerica",
                    "univalle",
                    "universidad del valle",
                    "cognitiv",
                    "psicometri",
                    "psychometr",
                ]),
                related_keywords: strings(&[
                    "estadistica",
                    "statistic",
                    "filosofia",
                    "philosophy",
                    "investigacion",
                    "research",
                    "ciencias sociales",
                    "social sciences",
                    "posgrado",
                    "postgrado",
                    "graduate",
                    "maestria",
                    "master",
                    "educacion",
                    "education",
                    "cali",
                    "valle del cauca",
                    "computacional",
                    "computational",
                ]),
            },
            scoring: ScoringConfig::default(),
            expiry_warning_days: default_warning_days(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(text: &str) -> Result<Self, SyncError> {
        let config: EngineConfig =
            serde_yaml::from_str(text).map_err(|e| SyncError::Config(format!("parsing profile.yaml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `profile.yaml`, or fall back to the built-in profile when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, SyncError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no profile file; using built-in profile");
                Ok(Self::default())
            }
            Err(err) => Err(SyncError::Config(format!("reading {}: {err}", path.display()))),
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.scoring.weak_threshold == 0 {
            return Err(SyncError::Config("scoring.weak_threshold must be at least 1".into()));
        }
        if self.scoring.strong_threshold < self.scoring.weak_threshold {
            return Err(SyncError::Config(
                "scoring.strong_threshold must not be below weak_threshold".into(),
            ));
        }
        if self.expiry_warning_days < 0 {
            return Err(SyncError::Config("expiry_warning_days must not be negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aot_adapters::SourceMode;

    #[test]
    fn registry_parses_modes_and_defaults() {
        let yaml = r#"
sources:
  - source_id: icetex
    display_name: ICETEX
    listing_url: https://web.icetex.gov.co/becas/becas-para-estudios-en-el-exterior
  - source_id: seed
    display_name: Seed list
    mode: manual
    enabled: false
"#;
        let registry = SourceRegistry::from_yaml(yaml).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert!(registry.sources[0].enabled);
        assert_eq!(registry.sources[0].mode, SourceMode::Web);
        assert_eq!(registry.sources[1].mode, SourceMode::Manual);
        assert_eq!(registry.enabled().count(), 1);
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let yaml = "sources:\n  - {source_id: a, display_name: A}\n  - {source_id: a, display_name: B}\n";
        assert!(matches!(SourceRegistry::from_yaml(yaml), Err(SyncError::Config(_))));
    }

    #[test]
    fn profile_yaml_fills_defaults() {
        let yaml = r#"
profile:
  discipline: [economia]
  areas: [econometria]
scoring:
  strong_threshold: 5
  weak_threshold: 1
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.profile.discipline, vec!["economia".to_string()]);
        assert!(config.profile.keywords.is_empty());
        assert_eq!(config.scoring.weights, ScoringWeights::default());
        assert_eq!(config.expiry_warning_days, 15);
    }

    #[test]
    fn inverted_thresholds_are_invalid() {
        let mut config = EngineConfig::default();
        config.scoring.strong_threshold = 1;
        config.scoring.weak_threshold = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_profile_uses_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_or_default(&dir.path().join("profile.yaml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
