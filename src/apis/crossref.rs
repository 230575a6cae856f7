use std::collections::BTreeMap;
use std::sync::Arc;

use super::unpaywall::UnpaywallClient;
use super::{
    decode_items, lenient, parse_json, Paper, PaperSource, SourceError, EXTRA_IS_OPEN_ACCESS, EXTRA_PDF_URL, EXTRA_TYPE,
    EXTRA_UNPAYWALL_DETECTED, SEARCH_TIMEOUT,
};
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

pub const BASE_URL: &str = "https://api.crossref.org/works";
pub const DEFAULT_USER_AGENT: &str = "paper-aggregator/0.1 (mailto:your-email@example.com)";

/// Order in which CrossRef date fields are consulted for the publication date.
const DATE_FIELDS: [&str; 3] = ["published-print", "published-online", "created"];

pub struct CrossRefClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
    limiter: Arc<RateLimiter>,
    unpaywall: Option<UnpaywallClient>,
}

impl CrossRefClient {
    pub fn new(
        limiter: Arc<RateLimiter>,
        base_url: Option<String>,
        user_agent: Option<String>,
        unpaywall: Option<UnpaywallClient>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| BASE_URL.to_string()),
            user_agent: user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            limiter,
            unpaywall,
        }
    }

    /// Second chance at open-access detection for papers CrossRef's own
    /// metadata doesn't mark as open. Resolver failures leave the paper as is.
    async fn augment_open_access(&self, paper: &mut Paper) {
        let (Some(unpaywall), Some(doi)) = (&self.unpaywall, paper.doi.as_deref()) else {
            return;
        };
        if paper.extra_bool(EXTRA_IS_OPEN_ACCESS) || doi.is_empty() {
            return;
        }
        let Some(oa) = unpaywall.check_open_access(doi).await else {
            return;
        };
        if !oa.is_open_access {
            return;
        }
        paper
            .extra
            .insert(EXTRA_IS_OPEN_ACCESS.to_string(), serde_json::Value::Bool(true));
        if paper.extra_str(EXTRA_PDF_URL).is_none() {
            if let Some(url) = oa.pdf_url {
                paper
                    .extra
                    .insert(EXTRA_PDF_URL.to_string(), serde_json::Value::from(url));
            }
        }
        paper
            .extra
            .insert(EXTRA_UNPAYWALL_DETECTED.to_string(), serde_json::Value::Bool(true));
    }
}

#[derive(Deserialize)]
struct CRResponse {
    message: CRMessage,
}
#[derive(Deserialize)]
struct CRMessage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}
#[derive(Deserialize)]
struct CRItem {
    #[serde(rename = "DOI", default, deserialize_with = "lenient")]
    doi: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    title: Option<Vec<String>>,
    #[serde(rename = "abstract", default, deserialize_with = "lenient")]
    abstract_text: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    author: Option<Vec<CRAuthor>>,
    #[serde(rename = "published-print", default, deserialize_with = "lenient")]
    published_print: Option<CRDate>,
    #[serde(rename = "published-online", default, deserialize_with = "lenient")]
    published_online: Option<CRDate>,
    #[serde(default, deserialize_with = "lenient")]
    created: Option<CRDate>,
    #[serde(rename = "container-title", default, deserialize_with = "lenient")]
    container_title: Option<Vec<String>>,
    #[serde(rename = "URL", default, deserialize_with = "lenient")]
    url: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "lenient")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    license: Option<Vec<CRLicense>>,
    #[serde(default, deserialize_with = "lenient")]
    link: Option<Vec<CRLink>>,
}
#[derive(Deserialize)]
struct CRAuthor {
    #[serde(default, deserialize_with = "lenient")]
    given: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    family: Option<String>,
}
#[derive(Deserialize)]
struct CRDate {
    #[serde(rename = "date-parts", default, deserialize_with = "lenient")]
    date_parts: Option<Vec<Vec<serde_json::Value>>>,
}
#[derive(Deserialize)]
struct CRLicense {
    #[serde(rename = "URL", default, deserialize_with = "lenient")]
    url: Option<String>,
    #[serde(rename = "content-version", default, deserialize_with = "lenient")]
    content_version: Option<String>,
    delay: Option<serde_json::Value>,
}
#[derive(Deserialize)]
struct CRLink {
    #[serde(rename = "URL", default, deserialize_with = "lenient")]
    url: Option<String>,
    #[serde(rename = "content-type", default, deserialize_with = "lenient")]
    content_type: Option<String>,
}

impl CRItem {
    fn date(&self, field: &str) -> Option<&CRDate> {
        match field {
            "published-print" => self.published_print.as_ref(),
            "published-online" => self.published_online.as_ref(),
            _ => self.created.as_ref(),
        }
    }
}

fn date_part(value: &serde_json::Value) -> Option<u32> {
    value
        .as_u64()
        .map(|n| n as u32)
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// `[[year, month?, day?]]`, missing month/day default to 1.
fn parse_date_parts(date: &CRDate) -> Option<NaiveDate> {
    let parts = date.date_parts.as_ref()?.first()?;
    let year = date_part(parts.first()?)?;
    let month = parts.get(1).and_then(date_part).unwrap_or(1);
    let day = parts.get(2).and_then(date_part).unwrap_or(1);
    NaiveDate::from_ymd_opt(year as i32, month, day)
}

fn is_open_license(license: &CRLicense) -> bool {
    let zero_delay = license
        .delay
        .as_ref()
        .and_then(|d| d.as_i64().or_else(|| d.as_str().and_then(|s| s.parse().ok())))
        == Some(0);
    license.content_version.as_deref() == Some("vor") || zero_delay
}

fn item_to_paper(item: CRItem, source: &str) -> Paper {
    let doi = item.doi.clone().filter(|d| !d.is_empty());
    let title = item
        .title
        .as_ref()
        .and_then(|t| t.first())
        .cloned()
        .unwrap_or_default();
    let authors = item
        .author
        .as_ref()
        .map(|authors| {
            authors
                .iter()
                .map(|a| {
                    format!(
                        "{} {}",
                        a.given.as_deref().unwrap_or(""),
                        a.family.as_deref().unwrap_or("")
                    )
                    .trim()
                    .to_string()
                })
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let published_at = DATE_FIELDS
        .iter()
        .filter_map(|field| item.date(field))
        .find_map(parse_date_parts);
    let journal = item
        .container_title
        .as_ref()
        .and_then(|c| c.first())
        .cloned();

    let mut is_open_access = false;
    let mut pdf_url = None;
    if let Some(license) = item.license.as_ref().and_then(|l| l.iter().find(|l| is_open_license(l))) {
        is_open_access = true;
        pdf_url = license.url.clone();
    }
    if pdf_url.is_none() {
        pdf_url = item
            .link
            .as_ref()
            .and_then(|links| {
                links
                    .iter()
                    .find(|l| l.content_type.as_deref() == Some("application/pdf"))
            })
            .and_then(|l| l.url.clone());
    }

    let mut extra = BTreeMap::new();
    extra.insert(
        EXTRA_TYPE.to_string(),
        item.kind.clone().map(serde_json::Value::from).unwrap_or_default(),
    );
    extra.insert(
        EXTRA_IS_OPEN_ACCESS.to_string(),
        serde_json::Value::Bool(is_open_access),
    );
    if let Some(url) = pdf_url {
        extra.insert(EXTRA_PDF_URL.to_string(), serde_json::Value::from(url));
    }

    let id = doi
        .clone()
        .or_else(|| item.url.clone())
        .unwrap_or_else(|| title.clone());

    Paper {
        id,
        title,
        abstract_text: item.abstract_text,
        authors,
        published_at,
        source: source.to_string(),
        url: item.url,
        doi,
        journal,
        extra,
    }
}

fn parse_works(body: &str, source: &str) -> Result<Vec<Paper>, SourceError> {
    let resp: CRResponse = parse_json(body)?;
    Ok(decode_items::<CRItem>(resp.message.items, source)
        .into_iter()
        .map(|item| item_to_paper(item, source))
        .collect())
}

#[async_trait]
impl PaperSource for CrossRefClient {
    fn name(&self) -> &str {
        "crossref"
    }

    async fn search(
        &self,
        query: &str,
        max_results: u32,
        from_year: Option<i32>,
    ) -> Result<Vec<Paper>, SourceError> {
        let mut params = vec![
            ("query", query.to_string()),
            ("rows", max_results.to_string()),
        ];
        if let Some(year) = from_year {
            params.push(("filter", format!("from-pub-date:{}-01-01", year)));
        }

        self.limiter.acquire().await;
        tracing::info!("Querying CrossRef: {}", query);
        let body = self
            .client
            .get(&self.base_url)
            .query(&params)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let mut papers = parse_works(&body, self.name())?;
        for paper in &mut papers {
            self.augment_open_access(paper).await;
        }
        Ok(papers)
    }
}
