use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Paper, PaperSource, SourceError, EXTRA_PDF_URL, SEARCH_TIMEOUT};
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use quick_xml::events::Event;
use quick_xml::Reader;

pub const BASE_URL: &str = "http://export.arxiv.org/api/query";

pub struct ArxivClient {
    client: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl ArxivClient {
    pub fn new(limiter: Arc<RateLimiter>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| BASE_URL.to_string()),
            limiter,
        }
    }
}

#[async_trait]
impl PaperSource for ArxivClient {
    fn name(&self) -> &str {
        "arxiv"
    }

    /// arXiv has no date filter on this endpoint, so `from_year` is not
    /// applied and older entries pass through unchanged.
    async fn search(
        &self,
        query: &str,
        max_results: u32,
        _from_year: Option<i32>,
    ) -> Result<Vec<Paper>, SourceError> {
        let search_query = format!("all:{}", query);
        let max_results = max_results.to_string();

        self.limiter.acquire().await;
        tracing::info!("Querying arXiv: {}", query);
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("search_query", search_query.as_str()),
                ("start", "0"),
                ("max_results", max_results.as_str()),
            ])
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_atom_feed(&resp, self.name())
    }
}

/// Rewrite an abstract page URL into its PDF URL.
pub(crate) fn abs_to_pdf_url(url: &str) -> String {
    let pdf = url.replace("/abs/", "/pdf/");
    if pdf.ends_with(".pdf") {
        pdf
    } else {
        format!("{}.pdf", pdf)
    }
}

fn parse_published(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.date_naive())
        .ok()
        .or_else(|| raw.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()))
}

fn parse_atom_feed(xml: &str, source: &str) -> Result<Vec<Paper>, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut papers = Vec::new();
    let mut in_entry = false;
    let mut in_author = false;
    let mut current_tag = String::new();
    let mut entry_id = String::new();
    let mut title = String::new();
    let mut summary = String::new();
    let mut published = String::new();
    let mut author_name = String::new();
    let mut authors: Vec<String> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if tag == "entry" {
                    in_entry = true;
                    entry_id.clear();
                    title.clear();
                    summary.clear();
                    published.clear();
                    authors.clear();
                } else if in_entry {
                    if tag == "author" {
                        in_author = true;
                        author_name.clear();
                    }
                    current_tag = tag;
                }
            }
            Ok(Event::Text(e)) if in_entry => {
                let text = e.unescape().unwrap_or_default().to_string();
                match current_tag.as_str() {
                    "id" => entry_id.push_str(&text),
                    "title" => title.push_str(&text),
                    "summary" => summary.push_str(&text),
                    "published" => published.push_str(&text),
                    "name" if in_author => author_name.push_str(&text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if tag == "entry" && in_entry {
                    in_entry = false;
                    papers.push(entry_to_paper(
                        entry_id.trim(),
                        &title,
                        &summary,
                        &published,
                        std::mem::take(&mut authors),
                        source,
                    ));
                } else if tag == "author" && in_author {
                    in_author = false;
                    let name = author_name.trim();
                    if !name.is_empty() {
                        authors.push(name.to_string());
                    }
                }
                if tag == current_tag {
                    current_tag.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Parse(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(papers)
}

fn entry_to_paper(
    entry_id: &str,
    title: &str,
    summary: &str,
    published: &str,
    authors: Vec<String>,
    source: &str,
) -> Paper {
    let mut extra = BTreeMap::new();
    if !entry_id.is_empty() {
        extra.insert(
            EXTRA_PDF_URL.to_string(),
            serde_json::Value::from(abs_to_pdf_url(entry_id)),
        );
    }
    let summary = summary.trim();

    Paper {
        id: entry_id.to_string(),
        title: title.trim().replace('\n', " "),
        abstract_text: if summary.is_empty() { None } else { Some(summary.to_string()) },
        authors,
        published_at: parse_published(published),
        source: source.to_string(),
        url: if entry_id.is_empty() { None } else { Some(entry_id.to_string()) },
        doi: None,
        journal: None,
        extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use std::time::Duration;

    const SAMPLE_ATOM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <entry>
    <id>http://arxiv.org/abs/2301.12345v1</id>
    <title>Test Paper on
 Graph Neural Networks</title>
    <summary>  This is a test abstract &amp; more.  </summary>
    <published>2023-01-15T00:00:00Z</published>
    <author><name>John Doe</name></author>
    <author><name>Jane Smith</name></author>
    <arxiv:doi>10.1000/ignored</arxiv:doi>
    <link href="http://arxiv.org/abs/2301.12345v1" rel="alternate" type="text/html"/>
    <link href="http://arxiv.org/pdf/2301.12345v1" title="pdf" type="application/pdf"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/1001.00001v2</id>
    <title>Old Paper</title>
    <published>2010-03-01T00:00:00Z</published>
  </entry>
</feed>"#;

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(100, Duration::from_secs(1)))
    }

    #[test]
    fn test_parse_atom_feed() {
        let papers = parse_atom_feed(SAMPLE_ATOM, "arxiv").unwrap();
        assert_eq!(papers.len(), 2);
        let p = &papers[0];
        assert_eq!(p.id, "http://arxiv.org/abs/2301.12345v1");
        assert_eq!(p.url.as_deref(), Some("http://arxiv.org/abs/2301.12345v1"));
        assert_eq!(p.title, "Test Paper on  Graph Neural Networks");
        assert_eq!(p.abstract_text.as_deref(), Some("This is a test abstract & more."));
        assert_eq!(p.authors, vec!["John Doe", "Jane Smith"]);
        assert_eq!(p.published_at, NaiveDate::from_ymd_opt(2023, 1, 15));
        assert_eq!(p.source, "arxiv");
        assert_eq!(p.doi, None);
        assert_eq!(
            p.extra_str(EXTRA_PDF_URL),
            Some("http://arxiv.org/pdf/2301.12345v1.pdf")
        );

        let old = &papers[1];
        assert!(old.authors.is_empty());
        assert_eq!(old.abstract_text, None);
    }

    #[test]
    fn test_abs_to_pdf_url() {
        assert_eq!(
            abs_to_pdf_url("http://arxiv.org/abs/2301.12345v1"),
            "http://arxiv.org/pdf/2301.12345v1.pdf"
        );
        assert_eq!(
            abs_to_pdf_url("http://arxiv.org/pdf/2301.12345v1.pdf"),
            "http://arxiv.org/pdf/2301.12345v1.pdf"
        );
    }

    #[test]
    fn test_malformed_xml_is_parse_error() {
        let err = parse_atom_feed("<feed><entry><id>x</entry></feed>", "arxiv").unwrap_err();
        assert!(matches!(err, SourceError::Parse(_)));
    }

    #[tokio::test]
    async fn test_search_ignores_from_year() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/query")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("search_query".into(), "all:graph neural networks".into()),
                Matcher::UrlEncoded("max_results".into(), "5".into()),
                Matcher::UrlEncoded("start".into(), "0".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/atom+xml")
            .with_body(SAMPLE_ATOM)
            .expect(1)
            .create_async()
            .await;

        let client = ArxivClient::new(limiter(), Some(format!("{}/api/query", server.url())));
        let papers = client
            .search("graph neural networks", 5, Some(2020))
            .await
            .unwrap();

        mock.assert_async().await;
        // The 2010 entry survives even though from_year is 2020.
        assert_eq!(papers.len(), 2);
        assert_eq!(papers[1].published_at.map(|d| d.to_string()), Some("2010-03-01".into()));
    }

    #[tokio::test]
    async fn test_search_propagates_http_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/query")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client = ArxivClient::new(limiter(), Some(format!("{}/api/query", server.url())));
        let err = client.search("q", 5, None).await.unwrap_err();
        assert!(matches!(err, SourceError::Http(_)));
    }
}
