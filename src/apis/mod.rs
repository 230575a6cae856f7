pub mod arxiv;
pub mod crossref;
pub mod semantic_scholar;
pub mod unpaywall;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timeout applied to every search request.
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Direct link to the paper's full-text PDF.
pub const EXTRA_PDF_URL: &str = "pdf_url";
/// Boolean open-access flag set by sources that can detect it.
pub const EXTRA_IS_OPEN_ACCESS: &str = "is_open_access";
/// Upstream record type (e.g. `journal-article`).
pub const EXTRA_TYPE: &str = "type";
/// Set when open access was only established through Unpaywall.
pub const EXTRA_UNPAYWALL_DETECTED: &str = "unpaywall_detected";

/// A paper as returned by any source, normalized to one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub id: String,
    pub title: String,
    pub abstract_text: Option<String>,
    pub authors: Vec<String>,
    pub published_at: Option<NaiveDate>,
    pub source: String,
    pub url: Option<String>,
    pub doi: Option<String>,
    pub journal: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Paper {
    pub fn year(&self) -> Option<i32> {
        self.published_at.map(|d| d.year())
    }

    /// Identity used to collapse duplicates across sources.
    ///
    /// DOI (case-folded) when present, otherwise lowercased title, first
    /// author and year. Two distinct papers sharing title, first author and
    /// year collapse into one; that false merge is accepted.
    pub fn dedup_key(&self) -> String {
        match self.doi.as_deref().filter(|d| !d.is_empty()) {
            Some(doi) => format!("doi:{}", doi.to_lowercase()),
            None => {
                let first_author = self
                    .authors
                    .first()
                    .map(|a| a.to_lowercase())
                    .unwrap_or_default();
                format!(
                    "title:{}|author:{}|year:{}",
                    self.title.to_lowercase(),
                    first_author,
                    self.year().unwrap_or(0)
                )
            }
        }
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    pub fn extra_bool(&self, key: &str) -> bool {
        self.extra.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing API key: {0}")]
    MissingKey(String),
    #[error("Source task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SourceError {
    /// Configuration problems are fatal and never worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(self, SourceError::MissingKey(_))
    }
}

/// One external search API.
///
/// Implementations rate-limit themselves, issue exactly one request per
/// `search` call and map whatever comes back into [`Paper`] values. A
/// malformed field degrades to `None`; only a failed request or an
/// unreadable response body is an error.
#[async_trait]
pub trait PaperSource: Send + Sync {
    fn name(&self) -> &str;
    async fn search(
        &self,
        query: &str,
        max_results: u32,
        from_year: Option<i32>,
    ) -> Result<Vec<Paper>, SourceError>;
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, SourceError> {
    serde_json::from_str(body).map_err(|e| SourceError::Parse(format!("JSON parse error: {}", e)))
}

/// Field deserializer for upstream records: a value of the wrong shape
/// becomes `None` instead of failing the record.
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Decodes each raw result item on its own. Items that are not records at
/// all are skipped; the rest of the page survives.
pub(crate) fn decode_items<T: serde::de::DeserializeOwned>(
    items: Vec<serde_json::Value>,
    source: &str,
) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!("Skipping unreadable {} record: {}", source, e);
                None
            }
        })
        .collect()
}
