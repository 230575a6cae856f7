use std::sync::Arc;
use std::time::Duration;

use super::{parse_json, SourceError};
use crate::rate_limit::RateLimiter;
use serde::{Deserialize, Serialize};

pub const BASE_URL: &str = "https://api.unpaywall.org/v2";
const TIMEOUT: Duration = Duration::from_secs(10);

/// Open-access lookups by DOI.
///
/// Unpaywall only reports legal open-access copies. The contact email is
/// sent with every request as its terms require.
pub struct UnpaywallClient {
    client: reqwest::Client,
    base_url: String,
    email: String,
    limiter: Arc<RateLimiter>,
}

/// Result of a successful open-access lookup.
#[derive(Debug, Clone, Serialize)]
pub struct OpenAccessInfo {
    pub is_open_access: bool,
    pub pdf_url: Option<String>,
    pub best_location: Option<OaLocation>,
    pub locations: Vec<OaLocation>,
    pub year: Option<i32>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OaLocation {
    pub url: Option<String>,
    pub url_for_pdf: Option<String>,
    pub host_type: Option<String>,
    pub license: Option<String>,
    pub version: Option<String>,
}

#[derive(Deserialize)]
struct UnpaywallResponse {
    #[serde(default)]
    is_oa: bool,
    best_oa_location: Option<OaLocation>,
    #[serde(default)]
    oa_locations: Vec<OaLocation>,
    year: Option<i32>,
    title: Option<String>,
}

impl UnpaywallClient {
    pub fn new(email: String, limiter: Arc<RateLimiter>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| BASE_URL.to_string()),
            email,
            limiter,
        }
    }

    /// `None` means "no information": empty DOI, not open access, or the
    /// lookup failed. Failures are logged, never returned.
    pub async fn check_open_access(&self, doi: &str) -> Option<OpenAccessInfo> {
        let doi = clean_doi(doi);
        if doi.is_empty() {
            return None;
        }
        match self.lookup(doi).await {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!("Unpaywall lookup for {} failed: {}", doi, e);
                None
            }
        }
    }

    async fn lookup(&self, doi: &str) -> Result<Option<OpenAccessInfo>, SourceError> {
        let url = format!("{}/{}", self.base_url, doi);
        self.limiter.acquire().await;
        let body = self
            .client
            .get(&url)
            .query(&[("email", self.email.as_str())])
            .timeout(TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let data: UnpaywallResponse = parse_json(&body)?;
        Ok(into_info(data))
    }
}

fn clean_doi(doi: &str) -> &str {
    let doi = doi.trim();
    doi.strip_prefix("https://doi.org/")
        .or_else(|| doi.strip_prefix("http://dx.doi.org/"))
        .unwrap_or(doi)
        .trim()
}

fn into_info(data: UnpaywallResponse) -> Option<OpenAccessInfo> {
    if !data.is_oa {
        return None;
    }
    let pdf_url = data.best_oa_location.as_ref().and_then(|loc| {
        loc.url_for_pdf
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| loc.url.clone().filter(|u| !u.is_empty()))
    });
    Some(OpenAccessInfo {
        is_open_access: true,
        pdf_url,
        best_location: data.best_oa_location,
        locations: data.oa_locations,
        year: data.year,
        title: data.title,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn client(server: &mockito::ServerGuard) -> UnpaywallClient {
        UnpaywallClient::new(
            "me@example.org".into(),
            Arc::new(RateLimiter::new(100, Duration::from_secs(1))),
            Some(format!("{}/v2", server.url())),
        )
    }

    #[test]
    fn test_clean_doi() {
        assert_eq!(clean_doi("https://doi.org/10.1/x"), "10.1/x");
        assert_eq!(clean_doi("http://dx.doi.org/10.1/x "), "10.1/x");
        assert_eq!(clean_doi("10.1/x"), "10.1/x");
        assert_eq!(clean_doi("https://doi.org/"), "");
    }

    #[tokio::test]
    async fn test_empty_doi_makes_no_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let c = client(&server);
        assert!(c.check_open_access("").await.is_none());
        assert!(c.check_open_access("https://doi.org/").await.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_open_access_prefers_pdf_then_landing_url() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/10.1/pdf")
            .match_query(Matcher::UrlEncoded("email".into(), "me@example.org".into()))
            .with_status(200)
            .with_body(
                json!({
                    "is_oa": true,
                    "year": 2021,
                    "title": "Open",
                    "best_oa_location": {"url": "http://landing", "url_for_pdf": "http://file.pdf"},
                    "oa_locations": [{"url": "http://landing"}, {"url": "http://mirror"}]
                })
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/v2/10.1/landing")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({"is_oa": true, "best_oa_location": {"url": "http://landing", "url_for_pdf": null}})
                    .to_string(),
            )
            .create_async()
            .await;

        let c = client(&server);
        let info = c.check_open_access("https://doi.org/10.1/pdf").await.unwrap();
        assert!(info.is_open_access);
        assert_eq!(info.pdf_url.as_deref(), Some("http://file.pdf"));
        assert_eq!(info.locations.len(), 2);
        assert_eq!(info.year, Some(2021));

        let landing = c.check_open_access("10.1/landing").await.unwrap();
        assert_eq!(landing.pdf_url.as_deref(), Some("http://landing"));
    }

    #[tokio::test]
    async fn test_closed_and_failed_lookups_are_none() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/10.1/closed")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"is_oa": false, "best_oa_location": null}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v2/10.1/missing")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/v2/10.1/garbled")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let c = client(&server);
        assert!(c.check_open_access("10.1/closed").await.is_none());
        assert!(c.check_open_access("10.1/missing").await.is_none());
        assert!(c.check_open_access("10.1/garbled").await.is_none());
    }
}
