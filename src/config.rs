use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::apis::{self, PaperSource};
use crate::rate_limit::RateLimiter;
use crate::search::FanOut;
use crate::storage::StorageBackend;

/// Identifiers accepted in `enabled_sources`.
pub const KNOWN_SOURCES: [&str; 3] = ["arxiv", "crossref", "semantic_scholar"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Aggregator configuration, from a JSON file or environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled_sources: Vec<String>,
    pub fan_out: FanOut,
    pub rate_limit: RateLimitConfig,
    pub sources: SourcesConfig,
    pub storage: StorageConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub arxiv: ArxivConfig,
    pub crossref: CrossRefConfig,
    pub semantic_scholar: SemanticScholarConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArxivConfig {
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossRefConfig {
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    pub unpaywall_email: Option<String>,
    pub unpaywall_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticScholarConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub output_dir: PathBuf,
    pub requests_per_minute: u32,
    pub max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled_sources: vec!["arxiv".to_string(), "crossref".to_string()],
            fan_out: FanOut::Concurrent,
            rate_limit: RateLimitConfig::default(),
            sources: SourcesConfig::default(),
            storage: StorageConfig::default(),
            download: DownloadConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests_per_minute: 20 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Csv,
            output_path: PathBuf::from("data/results.csv"),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            requests_per_minute: 5,
            max_attempts: 3,
        }
    }
}

impl Config {
    /// `PAPER_AGG_CONFIG` names a JSON file if set, otherwise the
    /// environment is read directly.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var("PAPER_AGG_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim())),
            _ => Ok(Self::from_env()),
        }
    }

    /// Parse a JSON config file. A top-level `default` object, if present,
    /// is used as the configuration root.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let mut value: serde_json::Value = serde_json::from_str(text)?;
        if let Some(inner) = value.get_mut("default").map(serde_json::Value::take) {
            value = inner;
        }
        serde_json::from_value(value)
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(list) = get("PAPER_AGG_SOURCES") {
            config.enabled_sources = parse_source_list(&list);
        }
        if let Some(rpm) = get("PAPER_AGG_REQUESTS_PER_MINUTE").and_then(|v| v.parse().ok()) {
            config.rate_limit.requests_per_minute = rpm;
        }
        match get("PAPER_AGG_FAN_OUT").map(|v| v.to_lowercase()).as_deref() {
            Some("sequential") => config.fan_out = FanOut::Sequential,
            Some("concurrent") | None => {}
            Some(other) => tracing::warn!("Ignoring PAPER_AGG_FAN_OUT={}", other),
        }

        config.sources.arxiv.base_url = get("ARXIV_BASE_URL");
        config.sources.crossref.base_url = get("CROSSREF_BASE_URL");
        config.sources.crossref.user_agent = get("CROSSREF_USER_AGENT");
        config.sources.crossref.unpaywall_email = get("UNPAYWALL_EMAIL");
        config.sources.crossref.unpaywall_base_url = get("UNPAYWALL_BASE_URL");
        config.sources.semantic_scholar.base_url = get("SEMANTIC_SCHOLAR_BASE_URL");
        config.sources.semantic_scholar.api_key = get("SEMANTIC_SCHOLAR_API_KEY");

        if let Some(backend) = get("PAPER_AGG_STORAGE_BACKEND") {
            match backend.parse() {
                Ok(backend) => config.storage.backend = backend,
                Err(e) => tracing::warn!("Ignoring PAPER_AGG_STORAGE_BACKEND: {}", e),
            }
        }
        if let Some(path) = get("PAPER_AGG_OUTPUT_PATH") {
            config.storage.output_path = PathBuf::from(path);
        }
        if let Some(dir) = get("PAPER_AGG_DOWNLOAD_DIR") {
            config.download.output_dir = PathBuf::from(dir);
        }
        if let Some(rpm) = get("PAPER_AGG_DOWNLOAD_REQUESTS_PER_MINUTE").and_then(|v| v.parse().ok()) {
            config.download.requests_per_minute = rpm;
        }

        config
    }

    /// The request budget every source (and the Unpaywall resolver) draws from.
    pub fn shared_limiter(&self) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::per_minute(self.rate_limit.requests_per_minute))
    }

    /// Build the enabled sources in configured order, all sharing `limiter`.
    pub fn build_sources(&self, limiter: &Arc<RateLimiter>) -> Vec<Arc<dyn PaperSource>> {
        self.build_selected_sources(&self.enabled_sources, limiter)
    }

    /// Build sources for an explicit selection, which replaces
    /// `enabled_sources` for this call. Unknown names are skipped.
    pub fn build_selected_sources(
        &self,
        names: &[String],
        limiter: &Arc<RateLimiter>,
    ) -> Vec<Arc<dyn PaperSource>> {
        let mut sources: Vec<Arc<dyn PaperSource>> = Vec::new();

        for name in names {
            match canonical_source_name(name) {
                Some("arxiv") => sources.push(Arc::new(apis::arxiv::ArxivClient::new(
                    Arc::clone(limiter),
                    self.sources.arxiv.base_url.clone(),
                ))),
                Some("crossref") => {
                    let cfg = &self.sources.crossref;
                    let unpaywall = cfg
                        .unpaywall_email
                        .as_ref()
                        .filter(|email| !email.trim().is_empty())
                        .map(|email| {
                            apis::unpaywall::UnpaywallClient::new(
                                email.clone(),
                                Arc::clone(limiter),
                                cfg.unpaywall_base_url.clone(),
                            )
                        });
                    sources.push(Arc::new(apis::crossref::CrossRefClient::new(
                        Arc::clone(limiter),
                        cfg.base_url.clone(),
                        cfg.user_agent.clone(),
                        unpaywall,
                    )));
                }
                Some("semantic_scholar") => {
                    let cfg = &self.sources.semantic_scholar;
                    sources.push(Arc::new(apis::semantic_scholar::SemanticScholarClient::new(
                        Arc::clone(limiter),
                        cfg.base_url.clone(),
                        cfg.api_key.clone(),
                    )));
                }
                _ => tracing::warn!("Ignoring unknown paper source: {}", name),
            }
        }

        sources
    }

    /// Standalone Unpaywall client for direct DOI lookups.
    pub fn build_unpaywall(
        &self,
        limiter: &Arc<RateLimiter>,
    ) -> Option<apis::unpaywall::UnpaywallClient> {
        self.unpaywall_email().map(|email| {
            apis::unpaywall::UnpaywallClient::new(
                email.to_string(),
                Arc::clone(limiter),
                self.sources.crossref.unpaywall_base_url.clone(),
            )
        })
    }

    /// Contact email for Unpaywall; blank counts as unset.
    fn unpaywall_email(&self) -> Option<&str> {
        self.sources
            .crossref
            .unpaywall_email
            .as_deref()
            .filter(|email| !email.trim().is_empty())
    }

    /// Return a list of source status descriptions.
    pub fn source_status(&self) -> Vec<SourceStatus> {
        let enabled: Vec<&str> = self
            .enabled_sources
            .iter()
            .filter_map(|s| canonical_source_name(s))
            .collect();
        let has_key = self
            .sources
            .semantic_scholar
            .api_key
            .as_ref()
            .is_some_and(|k| !k.trim().is_empty());
        let has_email = self.unpaywall_email().is_some();

        KNOWN_SOURCES
            .iter()
            .map(|&name| {
                let note = match name {
                    "arxiv" => "No API key required; from_year is not applied".to_string(),
                    "crossref" if has_email => "Unpaywall open-access fallback enabled".to_string(),
                    "crossref" => "No API key required; set UNPAYWALL_EMAIL for open-access fallback".to_string(),
                    _ if has_key => "API key set".to_string(),
                    _ => "API key missing: searches will fail".to_string(),
                };
                SourceStatus {
                    name: name.to_string(),
                    enabled: enabled.contains(&name),
                    note,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub enabled: bool,
    pub note: String,
}

/// Case-insensitive lookup; `semanticscholar` is an accepted alias.
pub fn canonical_source_name(name: &str) -> Option<&'static str> {
    match name.trim().to_lowercase().as_str() {
        "arxiv" => Some("arxiv"),
        "crossref" => Some("crossref"),
        "semantic_scholar" | "semanticscholar" => Some("semantic_scholar"),
        _ => None,
    }
}

fn parse_source_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config.enabled_sources, vec!["arxiv", "crossref"]);
        assert_eq!(config.fan_out, FanOut::Concurrent);
        assert_eq!(config.rate_limit.requests_per_minute, 20);
        assert_eq!(config.storage.backend, StorageBackend::Csv);
        assert_eq!(config.storage.output_path, PathBuf::from("data/results.csv"));
        assert_eq!(config.download.output_dir, PathBuf::from("downloads"));
        assert!(config.sources.crossref.unpaywall_email.is_none());
    }

    #[test]
    fn test_from_env_vars() {
        let config = Config::from_lookup(lookup(&[
            ("PAPER_AGG_SOURCES", "Semantic_Scholar, arxiv,,"),
            ("PAPER_AGG_REQUESTS_PER_MINUTE", "7"),
            ("SEMANTIC_SCHOLAR_API_KEY", "k"),
            ("UNPAYWALL_EMAIL", "  "),
            ("PAPER_AGG_STORAGE_BACKEND", "json"),
            ("PAPER_AGG_FAN_OUT", "Sequential"),
        ]));
        assert_eq!(config.fan_out, FanOut::Sequential);
        assert_eq!(config.enabled_sources, vec!["semantic_scholar", "arxiv"]);
        assert_eq!(config.rate_limit.requests_per_minute, 7);
        assert_eq!(config.sources.semantic_scholar.api_key.as_deref(), Some("k"));
        assert!(config.sources.crossref.unpaywall_email.is_none());
        assert_eq!(config.storage.backend, StorageBackend::Json);
    }

    #[test]
    fn test_from_json_with_default_node() {
        let config = Config::from_json(
            r#"{"default": {
                "enabled_sources": ["crossref", "semanticscholar"],
                "rate_limit": {"requests_per_minute": 0},
                "sources": {"crossref": {"unpaywall_email": "me@example.org"}},
                "storage": {"backend": "json", "output_path": "out/papers.json"}
            }}"#,
        )
        .unwrap();
        assert_eq!(config.enabled_sources, vec!["crossref", "semanticscholar"]);
        assert_eq!(config.rate_limit.requests_per_minute, 0);
        assert_eq!(config.storage.backend, StorageBackend::Json);
        assert_eq!(config.download.requests_per_minute, 5);
        assert!(Config::from_json(r#"{"storage": {"backend": "sqlite"}}"#).is_err());
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(Config::from_file(&missing), Err(ConfigError::Io { .. })));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{").unwrap();
        assert!(matches!(Config::from_file(&bad), Err(ConfigError::Json { .. })));
    }

    #[test]
    fn test_build_sources_keeps_order_and_skips_unknown() {
        let mut config = Config::default();
        config.enabled_sources = vec![
            "CrossRef".into(),
            "scopus".into(),
            "semanticscholar".into(),
            "arxiv".into(),
        ];
        let limiter = config.shared_limiter();
        let names: Vec<_> = config
            .build_sources(&limiter)
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["crossref", "semantic_scholar", "arxiv"]);

        let selected = config.build_selected_sources(&["arxiv".to_string()], &limiter);
        assert_eq!(selected.len(), 1);
        assert!(config.build_selected_sources(&[], &limiter).is_empty());
    }

    #[test]
    fn test_unpaywall_built_only_with_email() {
        let mut config = Config::default();
        let limiter = config.shared_limiter();
        assert!(config.build_unpaywall(&limiter).is_none());
        config.sources.crossref.unpaywall_email = Some("me@example.org".into());
        assert!(config.build_unpaywall(&limiter).is_some());
    }

    #[test]
    fn test_source_status() {
        let config = Config::default();
        let statuses = config.source_status();
        assert_eq!(statuses.len(), 3);
        assert!(statuses[0].enabled);
        assert!(statuses[1].enabled);
        assert!(!statuses[2].enabled);
        assert!(statuses[2].note.contains("missing"));
    }

    #[test]
    fn test_blank_email_reported_as_disabled_fallback() {
        let config =
            Config::from_json(r#"{"sources": {"crossref": {"unpaywall_email": "  "}}}"#).unwrap();
        assert!(config.build_unpaywall(&config.shared_limiter()).is_none());
        let crossref = &config.source_status()[1];
        assert_eq!(crossref.name, "crossref");
        assert!(!crossref.note.contains("enabled"));

        let config =
            Config::from_json(r#"{"sources": {"crossref": {"unpaywall_email": "me@example.org"}}}"#)
                .unwrap();
        assert!(config.source_status()[1].note.contains("enabled"));
    }
}
