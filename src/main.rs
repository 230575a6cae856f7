use std::path::PathBuf;
use std::sync::Arc;

use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

mod apis;
mod config;
mod download;
mod rate_limit;
mod search;
mod storage;

use apis::{Paper, PaperSource};
use config::Config;
use download::{PdfDownloader, RetryPolicy};
use rate_limit::RateLimiter;
use storage::StorageBackend;

const DEFAULT_MAX_RESULTS: u32 = 50;

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchPapersParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Sources to query, in priority order (e.g. [\"arxiv\", \"crossref\"]). Defaults to the configured sources")]
    sources: Option<Vec<String>>,
    #[schemars(description = "Maximum results per source (default 50)")]
    max_results: Option<u32>,
    #[schemars(description = "Only papers published in or after this year (not applied by arxiv)")]
    from_year: Option<i32>,
    #[schemars(description = "Keep only papers whose title contains this text (case-insensitive)")]
    title_filter: Option<String>,
    #[schemars(description = "Save the results to the configured output file")]
    save: Option<bool>,
    #[schemars(description = "Save the results to this file instead of the configured one")]
    output_path: Option<String>,
    #[schemars(description = "File format when saving: 'csv' (default) or 'json'")]
    format: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DownloadPapersParams {
    #[schemars(description = "Search query string")]
    query: String,
    #[schemars(description = "Sources to query, in priority order. Defaults to the configured sources")]
    sources: Option<Vec<String>>,
    #[schemars(description = "Maximum results per source (default 50)")]
    max_results: Option<u32>,
    #[schemars(description = "Only papers published in or after this year (not applied by arxiv)")]
    from_year: Option<i32>,
    #[schemars(description = "Keep only papers whose title contains this text (case-insensitive)")]
    title_filter: Option<String>,
    #[schemars(description = "Directory for downloaded PDFs. Defaults to the configured download directory")]
    output_dir: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetPdfUrlParams {
    #[schemars(description = "DOI of the paper")]
    doi: String,
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PaperAggregatorServer {
    tool_router: ToolRouter<Self>,
    config: Arc<Config>,
    limiter: Arc<RateLimiter>,
    sources: Arc<Vec<Arc<dyn PaperSource>>>,
    downloader: Arc<PdfDownloader>,
    download_limiter: Arc<RateLimiter>,
    unpaywall: Option<Arc<apis::unpaywall::UnpaywallClient>>,
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[tool_router]
impl PaperAggregatorServer {
    pub fn create() -> anyhow::Result<Self> {
        let config = Config::load()?;
        let limiter = config.shared_limiter();
        let sources = config.build_sources(&limiter);
        let unpaywall = config.build_unpaywall(&limiter).map(Arc::new);
        let download_limiter = Arc::new(RateLimiter::per_minute(config.download.requests_per_minute));
        let downloader = PdfDownloader::new(config.download.output_dir.clone(), Arc::clone(&download_limiter))
            .with_retry_policy(Self::retry_policy(&config));

        tracing::info!(
            "Initialized {} paper sources ({} requests/min), downloads to {}",
            sources.len(),
            config.rate_limit.requests_per_minute,
            downloader.output_dir().display()
        );

        Ok(Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            limiter,
            sources: Arc::new(sources),
            downloader: Arc::new(downloader),
            download_limiter,
            unpaywall,
        })
    }

    #[tool(description = "List available paper sources and their status")]
    async fn list_sources(&self) -> Result<CallToolResult, McpError> {
        to_json(&self.config.source_status())
    }

    #[tool(description = "Search papers across sources. Returns one deduplicated list in source-priority order.")]
    async fn search_papers(
        &self,
        Parameters(params): Parameters<SearchPapersParams>,
    ) -> Result<CallToolResult, McpError> {
        let backend = params
            .format
            .as_deref()
            .map(str::parse::<StorageBackend>)
            .transpose()
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?
            .unwrap_or(self.config.storage.backend);

        let papers = self
            .aggregate(
                &params.query,
                params.sources.as_deref(),
                params.max_results,
                params.from_year,
                params.title_filter.as_deref(),
            )
            .await?;

        let output_path = match params.output_path {
            Some(path) => Some(PathBuf::from(path)),
            None if params.save.unwrap_or(false) => Some(self.config.storage.output_path.clone()),
            None => None,
        };
        let papers = match output_path {
            Some(path) => storage::save_papers_async(papers, backend, path)
                .await
                .map_err(|e| McpError::internal_error(format!("Failed to save results: {}", e), None))?,
            None => papers,
        };

        to_json(&papers)
    }

    #[tool(description = "Search papers, then download PDFs for the open-access results. Reports one outcome per paper.")]
    async fn download_papers(
        &self,
        Parameters(params): Parameters<DownloadPapersParams>,
    ) -> Result<CallToolResult, McpError> {
        let papers = self
            .aggregate(
                &params.query,
                params.sources.as_deref(),
                params.max_results,
                params.from_year,
                params.title_filter.as_deref(),
            )
            .await?;

        let custom;
        let downloader = match params.output_dir {
            Some(dir) => {
                custom = PdfDownloader::new(dir, Arc::clone(&self.download_limiter))
                    .with_retry_policy(Self::retry_policy(&self.config));
                &custom
            }
            None => self.downloader.as_ref(),
        };

        let open: Vec<Paper> = papers
            .into_iter()
            .filter(|p| downloader.is_open_access(p))
            .collect();

        let outcomes = downloader
            .download_all(&open, |progress| {
                tracing::info!(
                    "[{}/{}] {:?}: {}",
                    progress.current,
                    progress.total,
                    progress.status,
                    progress.title
                );
            })
            .await;

        to_json(&outcomes)
    }

    #[tool(description = "Check open-access status for a DOI via Unpaywall and return the best PDF link")]
    async fn get_pdf_url(
        &self,
        Parameters(params): Parameters<GetPdfUrlParams>,
    ) -> Result<CallToolResult, McpError> {
        let client = self.unpaywall.as_ref().ok_or_else(|| {
            McpError::invalid_params(
                "Unpaywall not configured. Set UNPAYWALL_EMAIL environment variable.".to_string(),
                None,
            )
        })?;

        match client.check_open_access(&params.doi).await {
            Some(info) => to_json(&info),
            None => Ok(CallToolResult::success(vec![Content::text(format!(
                "No open-access copy found for DOI: {}",
                params.doi
            ))])),
        }
    }
}

impl PaperAggregatorServer {
    fn retry_policy(config: &Config) -> RetryPolicy {
        RetryPolicy {
            max_attempts: config.download.max_attempts.max(1),
            ..RetryPolicy::default()
        }
    }

    /// Run one aggregation, honouring an optional per-call source selection.
    async fn aggregate(
        &self,
        query: &str,
        selection: Option<&[String]>,
        max_results: Option<u32>,
        from_year: Option<i32>,
        title_filter: Option<&str>,
    ) -> Result<Vec<Paper>, McpError> {
        let selected;
        let sources: &[Arc<dyn PaperSource>] = match selection {
            Some(names) if !names.is_empty() => {
                selected = self.config.build_selected_sources(names, &self.limiter);
                &selected
            }
            _ => self.sources.as_slice(),
        };
        let max_results = max_results.unwrap_or(DEFAULT_MAX_RESULTS).max(1);

        let papers = search::aggregate(sources, query, max_results, from_year, self.config.fan_out)
            .await
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;
        tracing::info!("Aggregated {} unique papers for {:?}", papers.len(), query);

        Ok(match title_filter {
            Some(needle) => search::filter_by_title(papers, needle),
            None => papers,
        })
    }
}

#[tool_handler]
impl ServerHandler for PaperAggregatorServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Aggregate academic paper search across arXiv, CrossRef and Semantic Scholar. \
                 Results are deduplicated by DOI, or by title, first author and year. \
                 Open-access PDFs can be downloaded; paywalled papers never are."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting paper-aggregator MCP server");

    let server = PaperAggregatorServer::create()?;
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}
