//! Local persistence of completed analyses.

use crate::model::SavedAnalysis;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Current UTC time as RFC 3339.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// Default directory for auto-saved analyses.
pub fn runs_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("no data directory available on this platform")?;
    Ok(base.join("stock-analysis").join("runs"))
}

pub fn save_analysis(record: &SavedAnalysis) -> Result<PathBuf> {
    save_analysis_in(&runs_dir()?, record)
}

/// Save a record as `<ticker>-<timestamp>.json` under `dir`.
pub fn save_analysis_in(dir: &Path, record: &SavedAnalysis) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let stamp: String = record
        .timestamp_utc
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let path = dir.join(format!("{}-{}.json", file_safe(&record.ticker), stamp));
    write_json(&path, record)?;
    tracing::debug!(path = %path.display(), "saved analysis");
    Ok(path)
}

pub fn export_json(path: &Path, record: &SavedAnalysis) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    write_json(path, record)
}

pub fn load_recent(limit: usize) -> Result<Vec<SavedAnalysis>> {
    load_recent_in(&runs_dir()?, limit)
}

/// Most recent saved analyses first. Unreadable files are skipped.
pub fn load_recent_in(dir: &Path, limit: usize) -> Result<Vec<SavedAnalysis>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut records: Vec<SavedAnalysis> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .filter_map(|p| {
            let raw = std::fs::read(&p).ok()?;
            serde_json::from_slice::<SavedAnalysis>(&raw).ok()
        })
        .collect();
    records.sort_by(|a, b| b.timestamp_utc.cmp(&a.timestamp_utc));
    records.truncate(limit);
    Ok(records)
}

fn write_json(path: &Path, record: &SavedAnalysis) -> Result<()> {
    let out = serde_json::to_vec_pretty(record)?;
    std::fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

fn file_safe(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnalysisPayload;
    use serde_json::json;

    fn record(ticker: &str, ts: &str) -> SavedAnalysis {
        SavedAnalysis {
            timestamp_utc: ts.to_string(),
            ticker: ticker.to_string(),
            endpoint: "http://localhost/api".to_string(),
            result: AnalysisPayload(json!({"analysis_summary": ticker})),
        }
    }

    #[test]
    fn saved_runs_load_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        save_analysis_in(dir.path(), &record("AAPL", "2026-01-01T10:00:00Z")).unwrap();
        save_analysis_in(dir.path(), &record("TSLA", "2026-01-02T10:00:00Z")).unwrap();
        std::fs::write(dir.path().join("junk.json"), b"{").unwrap();

        let loaded = load_recent_in(dir.path(), 10).unwrap();
        let tickers: Vec<_> = loaded.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, ["TSLA", "AAPL"]);

        assert_eq!(load_recent_in(dir.path(), 1).unwrap().len(), 1);
    }

    #[test]
    fn save_path_is_file_safe() {
        let dir = tempfile::tempdir().unwrap();
        let p = save_analysis_in(dir.path(), &record("BRK/B", "2026-01-01T10:00:00Z")).unwrap();
        assert_eq!(
            p.file_name().unwrap().to_str().unwrap(),
            "BRK_B-2026-01-01T10-00-00Z.json"
        );
    }

    #[test]
    fn export_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        export_json(&path, &record("MSFT", "2026-01-01T10:00:00Z")).unwrap();
        let back: SavedAnalysis = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(back.ticker, "MSFT");
    }

    #[test]
    fn missing_dir_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_recent_in(&dir.path().join("absent"), 5).unwrap().is_empty());
    }
}
