use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::apis::Paper;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unsupported storage backend: {0} (expected csv or json)")]
    UnknownBackend(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("save task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Csv,
    Json,
}

impl FromStr for StorageBackend {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(StorageBackend::Csv),
            "json" => Ok(StorageBackend::Json),
            other => Err(StorageError::UnknownBackend(other.to_string())),
        }
    }
}

/// Write papers to `path`, creating parent directories as needed.
pub fn save_papers(papers: &[Paper], backend: StorageBackend, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let rows: Vec<_> = papers.iter().map(paper_to_row).collect();
    match backend {
        StorageBackend::Csv => save_csv(&rows, path),
        StorageBackend::Json => save_json(&rows, path),
    }
}

/// [`save_papers`] on the blocking pool, for callers on the async runtime.
/// Hands the papers back once they are written.
pub async fn save_papers_async(
    papers: Vec<Paper>,
    backend: StorageBackend,
    path: PathBuf,
) -> Result<Vec<Paper>, StorageError> {
    tokio::task::spawn_blocking(move || save_papers(&papers, backend, &path).map(|()| papers)).await?
}

/// Flat, column-oriented view of a paper. Extra fields become `extra_<key>`.
fn paper_to_row(p: &Paper) -> BTreeMap<String, Value> {
    let mut row = BTreeMap::new();
    row.insert("id".to_string(), Value::from(p.id.clone()));
    row.insert("title".to_string(), Value::from(p.title.clone()));
    row.insert("abstract".to_string(), p.abstract_text.clone().map(Value::from).unwrap_or_default());
    row.insert("authors".to_string(), Value::from(p.authors.join("; ")));
    row.insert(
        "published_at".to_string(),
        p.published_at.map(|d| Value::from(d.to_string())).unwrap_or_default(),
    );
    row.insert("source".to_string(), Value::from(p.source.clone()));
    row.insert("url".to_string(), p.url.clone().map(Value::from).unwrap_or_default());
    row.insert("doi".to_string(), p.doi.clone().map(Value::from).unwrap_or_default());
    row.insert("journal".to_string(), p.journal.clone().map(Value::from).unwrap_or_default());
    for (key, value) in &p.extra {
        row.insert(format!("extra_{}", key), value.clone());
    }
    row
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => if *b { "True" } else { "False" }.to_string(),
        Some(other) => other.to_string(),
    }
}

fn save_csv(rows: &[BTreeMap<String, Value>], path: &Path) -> Result<(), StorageError> {
    if rows.is_empty() {
        tracing::info!("No papers to save to {}", path.display());
        return Ok(());
    }
    let columns: BTreeSet<&str> = rows.iter().flat_map(|r| r.keys().map(|k| k.as_str())).collect();

    let mut wtr = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    wtr.write_record(&columns)?;
    for row in rows {
        wtr.write_record(columns.iter().map(|c| cell(row.get(*c))))?;
    }
    wtr.flush()?;
    tracing::info!("Saved {} papers to {}", rows.len(), path.display());
    Ok(())
}

fn save_json(rows: &[BTreeMap<String, Value>], path: &Path) -> Result<(), StorageError> {
    let json = serde_json::to_string_pretty(rows)?;
    std::fs::write(path, json)?;
    tracing::info!("Saved {} papers to {}", rows.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::test_support::paper;
    use crate::apis::{EXTRA_IS_OPEN_ACCESS, EXTRA_PDF_URL};

    fn sample() -> Vec<Paper> {
        let mut a = paper("crossref", "Graph, Networks", Some("10.1/a"));
        a.authors.push("Alan Turing".into());
        a.extra.insert(EXTRA_IS_OPEN_ACCESS.into(), Value::Bool(true));
        let mut b = paper("arxiv", "Second", None);
        b.extra.insert(EXTRA_PDF_URL.into(), Value::from("http://arxiv.org/pdf/1.pdf"));
        vec![a, b]
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("CSV".parse::<StorageBackend>().unwrap(), StorageBackend::Csv);
        assert_eq!(" json ".parse::<StorageBackend>().unwrap(), StorageBackend::Json);
        assert!(matches!(
            "sqlite".parse::<StorageBackend>(),
            Err(StorageError::UnknownBackend(_))
        ));
    }

    #[tokio::test]
    async fn test_save_papers_async_returns_papers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let papers = save_papers_async(sample(), StorageBackend::Json, path.clone())
            .await
            .unwrap();
        assert_eq!(papers, sample());

        let saved: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0]["doi"], "10.1/a");
    }

    #[test]
    fn test_save_csv_unions_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.csv");
        save_papers(&sample(), StorageBackend::Csv, &path).unwrap();

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let headers = rdr.headers().unwrap().clone();
        let headers: Vec<_> = headers.iter().collect();
        assert_eq!(
            headers,
            vec![
                "abstract", "authors", "doi", "extra_is_open_access", "extra_pdf_url", "id",
                "journal", "published_at", "source", "title", "url"
            ]
        );
        let records: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][1], "Ada Lovelace; Alan Turing");
        assert_eq!(&records[0][3], "True");
        assert_eq!(&records[0][4], "");
        assert_eq!(&records[0][7], "2021-01-01");
        assert_eq!(&records[0][9], "Graph, Networks");
        assert_eq!(&records[1][4], "http://arxiv.org/pdf/1.pdf");
    }

    #[test]
    fn test_save_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        save_papers(&sample(), StorageBackend::Json, &path).unwrap();

        let rows: Vec<serde_json::Map<String, Value>> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["doi"], "10.1/a");
        assert_eq!(rows[0]["extra_is_open_access"], true);
        assert_eq!(rows[1]["doi"], Value::Null);
    }

    #[test]
    fn test_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("empty.csv");
        save_papers(&[], StorageBackend::Csv, &csv_path).unwrap();
        assert!(!csv_path.exists());

        let json_path = dir.path().join("empty.json");
        save_papers(&[], StorageBackend::Json, &json_path).unwrap();
        assert_eq!(std::fs::read_to_string(&json_path).unwrap(), "[]");
    }
}
