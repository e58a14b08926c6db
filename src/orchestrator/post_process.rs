//! Post-outcome processing.
//!
//! Handles auto-save and exports after an analysis completes successfully.

use crate::cli::Cli;
use crate::model::{AnalysisPayload, SavedAnalysis};
use crate::storage;

/// Result of post-outcome processing, ready for presentation layers.
pub struct ProcessedOutcome {
    pub export_messages: Vec<String>,
    pub auto_saved_path: Option<std::path::PathBuf>,
}

/// Stamp a completed analysis, auto-save it, and run requested exports.
pub fn process_outcome(args: &Cli, ticker: &str, payload: &AnalysisPayload) -> ProcessedOutcome {
    let record = SavedAnalysis {
        timestamp_utc: storage::now_rfc3339(),
        ticker: ticker.to_string(),
        endpoint: args.endpoint.clone(),
        result: payload.clone(),
    };

    let auto_saved_path = if args.auto_save {
        match storage::save_analysis(&record) {
            Ok(p) => Some(p),
            Err(e) => {
                let detail = format!("{e:#}");
                tracing::warn!(error = %detail, "auto-save failed");
                None
            }
        }
    } else {
        None
    };

    let mut export_messages = Vec::new();
    if let Some(export_path) = args.export_json.as_deref() {
        match storage::export_json(export_path, &record) {
            Ok(_) => export_messages.push(format!("Exported JSON: {}", export_path.display())),
            Err(e) => export_messages.push(format!("Export JSON failed: {e:#}")),
        }
    }

    ProcessedOutcome {
        export_messages,
        auto_saved_path,
    }
}
