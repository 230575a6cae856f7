use std::collections::HashSet;
use std::sync::Arc;

use crate::apis::{Paper, PaperSource, SourceError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("no paper sources configured")]
    NoSources,
}

/// How the per-source searches are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanOut {
    /// One task per source, all in flight at once.
    #[default]
    Concurrent,
    /// One source at a time, in configured order.
    Sequential,
}

/// Search every source, then merge the results.
///
/// Output order is source priority (the order of `sources`) then each
/// source's own response order. When two sources return the same
/// [`Paper::dedup_key`], the higher-priority source's record is kept no
/// matter which search finished first. A failing source is logged and
/// skipped; only an empty source list is an error.
pub async fn aggregate(
    sources: &[Arc<dyn PaperSource>],
    query: &str,
    max_results: u32,
    from_year: Option<i32>,
    fan_out: FanOut,
) -> Result<Vec<Paper>, AggregateError> {
    if sources.is_empty() {
        return Err(AggregateError::NoSources);
    }

    let per_source = match fan_out {
        FanOut::Concurrent => search_concurrently(sources, query, max_results, from_year).await,
        FanOut::Sequential => {
            let mut results = Vec::with_capacity(sources.len());
            for source in sources {
                results.push(source.search(query, max_results, from_year).await);
            }
            results
        }
    };

    let mut batches = Vec::with_capacity(per_source.len());
    for (source, result) in sources.iter().zip(per_source) {
        match result {
            Ok(papers) => {
                tracing::info!("Source {} returned {} papers", source.name(), papers.len());
                batches.push(papers);
            }
            Err(e) if e.is_configuration() => {
                tracing::warn!("Source {} is misconfigured: {}", source.name(), e)
            }
            Err(e) => tracing::warn!("Source {} failed: {}", source.name(), e),
        }
    }

    Ok(merge_in_priority_order(batches))
}

/// Spawn one task per source and collect results in source order, not
/// completion order.
async fn search_concurrently(
    sources: &[Arc<dyn PaperSource>],
    query: &str,
    max_results: u32,
    from_year: Option<i32>,
) -> Vec<Result<Vec<Paper>, SourceError>> {
    let handles: Vec<_> = sources
        .iter()
        .map(|source| {
            let source = Arc::clone(source);
            let query = query.to_string();
            tokio::spawn(async move { source.search(&query, max_results, from_year).await })
        })
        .collect();

    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap_or_else(|e| Err(SourceError::Task(e))))
        .collect()
}

/// First-seen-wins merge over batches already ordered by source priority.
fn merge_in_priority_order(batches: Vec<Vec<Paper>>) -> Vec<Paper> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged = Vec::new();
    for paper in batches.into_iter().flatten() {
        if seen.insert(paper.dedup_key()) {
            merged.push(paper);
        }
    }
    merged
}

/// Keep only papers whose title contains `needle`, ignoring case.
/// A blank needle keeps everything.
pub fn filter_by_title(papers: Vec<Paper>, needle: &str) -> Vec<Paper> {
    let needle = needle.trim().to_lowercase();
    if needle.is_empty() {
        return papers;
    }
    papers
        .into_iter()
        .filter(|p| p.title.to_lowercase().contains(&needle))
        .collect()
}
