use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reason shown when the backend reports a failure without saying why.
pub const GENERIC_ANALYSIS_FAILURE: &str = "Analysis failed";
/// Reason shown when the submission call itself could not be completed.
pub const GENERIC_SUBMISSION_FAILURE: &str = "An error occurred";
/// Reason shown when the job watch breaks before a terminal state is seen.
pub const WATCH_BROKEN: &str = "Error receiving analysis updates";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub endpoint: String,
    pub project_id: String,
    pub collection: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default, with = "humantime_serde")]
    pub watch_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub user_agent: String,
}

/// Bearer token issued by the identity service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn bearer(&self) -> &str {
        &self.0
    }
}

// Keep tokens out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// A single "analyze ticker X" action. Built per submission and dropped after dispatch.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub ticker: String,
    pub credential: Credential,
}

/// Result body produced by the analysis backend.
///
/// The delivery core treats this as opaque; the accessors exist for presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisPayload(pub serde_json::Value);

impl AnalysisPayload {
    /// Financial metrics as (label, display value) pairs, sorted by label.
    pub fn financial_metrics(&self) -> Vec<(String, String)> {
        let Some(map) = self.0.get("financial_metrics").and_then(|v| v.as_object()) else {
            return Vec::new();
        };
        map.iter()
            .map(|(k, v)| {
                let shown = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), shown)
            })
            .collect()
    }

    pub fn analysis_summary(&self) -> Option<&str> {
        self.0
            .get("analysis_summary")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}

/// Interpretation of the synchronous response to a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionResult {
    Completed(AnalysisPayload),
    Pending(String),
    Failed(String),
}

/// Job progress as observed through a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Running,
    Completed(AnalysisPayload),
    Failed(Option<String>),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed(_) | JobState::Failed(_))
    }

    /// Interpret a job document body (`status`, `result`, `error_message`).
    ///
    /// Returns `None` for shapes that cannot be understood, such as a completed
    /// status without a result.
    pub fn from_document(doc: &serde_json::Value) -> Option<JobState> {
        let status = doc.get("status").and_then(|v| v.as_str());
        match status {
            Some("completed") => doc
                .get("result")
                .filter(|r| !r.is_null())
                .map(|r| JobState::Completed(AnalysisPayload(r.clone()))),
            Some("error") => Some(JobState::Failed(
                doc.get("error_message")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            )),
            _ if doc.is_object() => Some(JobState::Running),
            _ => None,
        }
    }
}

/// What a watch reports back to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    State(JobState),
    Unrecognized,
    TransportError(String),
}

/// Push notification from a watch task, tagged with the generation of the handle that produced it.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub generation: u64,
    pub job_id: String,
    pub observation: Observation,
}

/// Terminal rendering outcome for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        ticker: String,
        payload: AnalysisPayload,
    },
    Error(String),
}

/// Controller state, readable by UI layers.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    Idle,
    Watching {
        ticker: String,
        job_id: String,
        generation: u64,
    },
    Rendered(Outcome),
}

impl DeliveryState {
    pub fn is_watching(&self) -> bool {
        matches!(self, DeliveryState::Watching { .. })
    }

    /// Render a short human-readable status line.
    pub fn to_message(&self) -> String {
        match self {
            DeliveryState::Idle => "Idle".to_string(),
            DeliveryState::Watching { ticker, job_id, .. } => {
                format!("Analysis of {ticker} in progress (job {job_id})")
            }
            DeliveryState::Rendered(Outcome::Success { ticker, .. }) => {
                format!("Analysis of {ticker} completed")
            }
            DeliveryState::Rendered(Outcome::Error(reason)) => format!("Failed: {reason}"),
        }
    }
}

/// Saved record of a successful analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedAnalysis {
    pub timestamp_utc: String,
    pub ticker: String,
    pub endpoint: String,
    pub result: AnalysisPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completed_document_carries_result() {
        let doc = json!({"status": "completed", "result": {"analysis_summary": "ok"}});
        assert_eq!(
            JobState::from_document(&doc),
            Some(JobState::Completed(AnalysisPayload(
                json!({"analysis_summary": "ok"})
            )))
        );
    }

    #[test]
    fn error_document_without_message_has_no_reason() {
        let doc = json!({"status": "error", "error_message": ""});
        assert_eq!(JobState::from_document(&doc), Some(JobState::Failed(None)));
    }

    #[test]
    fn other_statuses_are_running() {
        assert_eq!(
            JobState::from_document(&json!({"status": "processing"})),
            Some(JobState::Running)
        );
        assert_eq!(JobState::from_document(&json!({})), Some(JobState::Running));
    }

    #[test]
    fn completed_without_result_is_unrecognized() {
        assert_eq!(JobState::from_document(&json!({"status": "completed"})), None);
        assert_eq!(JobState::from_document(&json!("completed")), None);
    }

    #[test]
    fn payload_accessors() {
        let p = AnalysisPayload(json!({
            "financial_metrics": {"Revenue Growth": "12.5%", "P/E Ratio": 21.3},
            "analysis_summary": "  "
        }));
        let metrics = p.financial_metrics();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.contains(&("P/E Ratio".to_string(), "21.3".to_string())));
        assert_eq!(p.analysis_summary(), None);
    }

    #[test]
    fn credential_debug_is_redacted() {
        let c = Credential::new("secret-token");
        assert_eq!(format!("{c:?}"), "Credential(***)");
    }
}
