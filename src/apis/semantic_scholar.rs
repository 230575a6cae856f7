use std::collections::BTreeMap;
use std::sync::Arc;

use super::{decode_items, lenient, parse_json, Paper, PaperSource, SourceError, SEARCH_TIMEOUT};
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

pub const BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";
const FIELDS: &str = "title,abstract,authors,year,externalIds,url,journal";
const MAX_LIMIT: u32 = 100;

pub struct SemanticScholarClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<RateLimiter>,
}

impl SemanticScholarClient {
    pub fn new(limiter: Arc<RateLimiter>, base_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| BASE_URL.to_string()),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            limiter,
        }
    }
}

#[derive(Deserialize)]
struct S2SearchResponse {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    #[serde(default, deserialize_with = "lenient")]
    paper_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    title: Option<String>,
    #[serde(rename = "abstract", default, deserialize_with = "lenient")]
    abstract_text: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    authors: Option<Vec<S2Author>>,
    year: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "lenient")]
    external_ids: Option<S2ExternalIds>,
    #[serde(default, deserialize_with = "lenient")]
    url: Option<String>,
    journal: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct S2Author {
    #[serde(default, deserialize_with = "lenient")]
    name: Option<String>,
}

#[derive(Deserialize)]
struct S2ExternalIds {
    #[serde(rename = "DOI", default, deserialize_with = "lenient")]
    doi: Option<String>,
}

fn s2_to_paper(p: S2Paper, source: &str) -> Paper {
    let year = p
        .year
        .as_ref()
        .and_then(|y| y.as_i64().or_else(|| y.as_str().and_then(|s| s.parse().ok())));
    let journal = p
        .journal
        .as_ref()
        .and_then(|j| j.get("name"))
        .and_then(|n| n.as_str())
        .map(|s| s.to_string());
    let id = p
        .paper_id
        .clone()
        .filter(|id| !id.is_empty())
        .or_else(|| p.url.clone())
        .unwrap_or_default();

    Paper {
        id,
        title: p.title.unwrap_or_default(),
        abstract_text: p.abstract_text,
        authors: p
            .authors
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| a.name.filter(|n| !n.is_empty()))
            .collect(),
        published_at: year.and_then(|y| NaiveDate::from_ymd_opt(y as i32, 1, 1)),
        source: source.to_string(),
        url: p.url,
        doi: p.external_ids.and_then(|e| e.doi).filter(|d| !d.is_empty()),
        journal,
        extra: BTreeMap::new(),
    }
}

fn parse_search(body: &str, source: &str) -> Result<Vec<Paper>, SourceError> {
    let resp: S2SearchResponse = parse_json(body)?;
    Ok(decode_items::<S2Paper>(resp.data, source)
        .into_iter()
        .map(|p| s2_to_paper(p, source))
        .collect())
}

#[async_trait]
impl PaperSource for SemanticScholarClient {
    fn name(&self) -> &str {
        "semantic_scholar"
    }

    async fn search(
        &self,
        query: &str,
        max_results: u32,
        from_year: Option<i32>,
    ) -> Result<Vec<Paper>, SourceError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            SourceError::MissingKey(
                "Semantic Scholar requires sources.semantic_scholar.api_key (SEMANTIC_SCHOLAR_API_KEY)"
                    .to_string(),
            )
        })?;

        let url = format!("{}/paper/search", self.base_url);
        let mut params = vec![
            ("query", query.to_string()),
            ("limit", max_results.min(MAX_LIMIT).to_string()),
            ("fields", FIELDS.to_string()),
        ];
        if let Some(year) = from_year {
            params.push(("year", format!("{}-", year)));
        }

        self.limiter.acquire().await;
        tracing::info!("Querying Semantic Scholar: {}", query);
        let body = self
            .client
            .get(&url)
            .header("x-api-key", api_key)
            .query(&params)
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_search(&body, self.name())
    }
}
