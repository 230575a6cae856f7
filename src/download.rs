//! Open-access PDF retrieval.
//!
//! Only papers flagged as open access are ever downloaded. Everything else
//! is refused before any request is made.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::apis::arxiv::abs_to_pdf_url;
use crate::apis::{Paper, EXTRA_IS_OPEN_ACCESS, EXTRA_PDF_URL};
use crate::rate_limit::RateLimiter;

pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const MAX_TITLE_CHARS: usize = 100;
/// Every arXiv paper is open access.
const ALWAYS_OPEN_SOURCE: &str = "arxiv";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("'{title}' is not open access; refusing to download")]
    NotOpenAccess { title: String },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Timeouts, connection failures, 429 and 5xx responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Http(e) => match e.status() {
                Some(status) => {
                    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                }
                None => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            },
            DownloadError::NotOpenAccess { .. } | DownloadError::Io(_) => false,
        }
    }
}

/// Exponential backoff between download attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    InProgress,
    Succeeded,
    Failed,
}

/// Progress notification for one item of a batch.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress<'a> {
    pub current: usize,
    pub total: usize,
    pub title: &'a str,
    pub status: DownloadStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadOutcome {
    pub id: String,
    pub title: String,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
}

pub struct PdfDownloader {
    client: reqwest::Client,
    output_dir: PathBuf,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl PdfDownloader {
    pub fn new(output_dir: impl Into<PathBuf>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: reqwest::Client::new(),
            output_dir: output_dir.into(),
            limiter,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn is_open_access(&self, paper: &Paper) -> bool {
        paper.source == ALWAYS_OPEN_SOURCE || paper.extra_bool(EXTRA_IS_OPEN_ACCESS)
    }

    /// Direct PDF link for an open-access paper.
    ///
    /// A DOI alone is not enough: the resolver lands on a publisher page,
    /// which is never fetched automatically.
    pub fn resolve_pdf_url(&self, paper: &Paper) -> Option<String> {
        if !self.is_open_access(paper) {
            return None;
        }
        if let Some(url) = paper.extra_str(EXTRA_PDF_URL) {
            return Some(url.to_string());
        }
        if paper.source == ALWAYS_OPEN_SOURCE {
            return paper.url.as_deref().filter(|u| !u.is_empty()).map(abs_to_pdf_url);
        }
        None
    }

    pub fn target_path(&self, paper: &Paper) -> PathBuf {
        self.output_dir.join(pdf_file_name(&paper.title))
    }

    /// Download one paper's PDF.
    ///
    /// Returns `Ok(None)` when there is nothing to fetch or the server did
    /// not answer with a PDF. An existing file short-circuits without any
    /// request.
    pub async fn download(&self, paper: &Paper) -> Result<Option<PathBuf>, DownloadError> {
        if !self.is_open_access(paper) {
            return Err(DownloadError::NotOpenAccess {
                title: paper.title.clone(),
            });
        }
        let Some(pdf_url) = self.resolve_pdf_url(paper) else {
            return Ok(None);
        };

        let path = self.target_path(paper);
        if tokio::fs::try_exists(&path).await? {
            tracing::debug!("Already downloaded: {}", path.display());
            return Ok(Some(path));
        }
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let mut attempt = 1;
        loop {
            match self.fetch(&pdf_url, &path).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    tracing::warn!(
                        "Download of {} failed (attempt {}/{}): {}; retrying in {:?}",
                        pdf_url,
                        attempt,
                        self.retry.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch(&self, pdf_url: &str, path: &Path) -> Result<Option<PathBuf>, DownloadError> {
        self.limiter.acquire().await;
        tracing::info!("Downloading PDF from: {}", pdf_url);
        let mut response = self
            .client
            .get(pdf_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if !content_type.contains("pdf") && !pdf_url.to_lowercase().ends_with(".pdf") {
            tracing::warn!("Not a PDF ({}): {}", content_type, pdf_url);
            return Ok(None);
        }

        // Stream into a side file so an interrupted download never looks complete.
        let partial = partial_path(path);
        if let Err(e) = write_body(&mut response, &partial).await {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                tracing::debug!("Could not remove {}: {}", partial.display(), cleanup);
            }
            return Err(e);
        }
        tokio::fs::rename(&partial, path).await?;
        Ok(Some(path.to_path_buf()))
    }

    /// Download papers one at a time. Failures are recorded per item and
    /// never stop the batch.
    pub async fn download_all<F>(&self, papers: &[Paper], mut progress: F) -> Vec<DownloadOutcome>
    where
        F: FnMut(DownloadProgress<'_>),
    {
        let total = papers.len();
        let mut outcomes = Vec::with_capacity(total);
        for (idx, paper) in papers.iter().enumerate() {
            let report = move |status| DownloadProgress {
                current: idx + 1,
                total,
                title: &paper.title,
                status,
            };
            progress(report(DownloadStatus::InProgress));

            let (path, error) = match self.download(paper).await {
                Ok(path) => (path, None),
                Err(e) => {
                    tracing::warn!("Download failed for {}: {}", paper.id, e);
                    (None, Some(e.to_string()))
                }
            };
            let status = if path.is_some() {
                DownloadStatus::Succeeded
            } else {
                DownloadStatus::Failed
            };
            progress(report(status));

            outcomes.push(DownloadOutcome {
                id: paper.id.clone(),
                title: paper.title.clone(),
                path,
                error,
            });
        }
        outcomes
    }
}

async fn write_body(response: &mut reqwest::Response, partial: &Path) -> Result<(), DownloadError> {
    let mut file = tokio::fs::File::create(partial).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// File name derived from a title: punctuation dropped, at most 100
/// characters, whitespace and dash runs collapsed to one `-`. Edge
/// separators are kept, so `"Foo "` becomes `Foo-.pdf`.
pub fn pdf_file_name(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .take(MAX_TITLE_CHARS)
        .collect();

    let mut name = String::with_capacity(kept.len());
    let mut in_separator = false;
    for c in kept.chars() {
        if c == '-' || c.is_whitespace() {
            if !in_separator {
                name.push('-');
                in_separator = true;
            }
        } else {
            name.push(c);
            in_separator = false;
        }
    }

    if name.is_empty() {
        "paper.pdf".to_string()
    } else {
        format!("{}.pdf", name)
    }
}
