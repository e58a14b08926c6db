//! Analysis submission over HTTP.

use crate::error::DeliveryError;
use crate::model::{AnalysisPayload, AnalysisRequest, AppConfig, SubmissionResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;

/// Sends analysis requests to the backend.
///
/// Transport-level failures come back as `Err`; a failure the backend reports
/// on purpose comes back as `Ok(SubmissionResult::Failed)`.
#[async_trait]
pub trait AnalysisSubmitter: Send + Sync {
    async fn submit_analysis(
        &self,
        request: &AnalysisRequest,
    ) -> Result<SubmissionResult, DeliveryError>;
}

/// Build the shared HTTP client used by the submitter, the identity service and watchers.
pub fn build_http_client(cfg: &AppConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(cfg.user_agent.clone())
        .timeout(cfg.request_timeout)
        .build()
        .context("failed to build HTTP client")
}

pub struct HttpSubmitter {
    http: reqwest::Client,
    endpoint: reqwest::Url,
}

impl HttpSubmitter {
    pub fn new(http: reqwest::Client, endpoint: &str) -> Result<Self> {
        let endpoint = reqwest::Url::parse(endpoint)
            .with_context(|| format!("invalid analysis endpoint: {endpoint}"))?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl AnalysisSubmitter for HttpSubmitter {
    async fn submit_analysis(
        &self,
        request: &AnalysisRequest,
    ) -> Result<SubmissionResult, DeliveryError> {
        tracing::debug!(ticker = %request.ticker, endpoint = %self.endpoint, "submitting analysis");
        let resp = self
            .http
            .post(self.endpoint.clone())
            .header(header::ACCEPT, "application/json")
            .bearer_auth(request.credential.bearer())
            .json(&serde_json::json!({ "ticker": request.ticker }))
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "analysis submission failed");
                DeliveryError::transport()
            })?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| {
            tracing::warn!(error = %e, "failed to read submission response");
            DeliveryError::transport()
        })?;
        interpret_response(status, &body)
    }
}

#[derive(Debug, Deserialize)]
struct SubmissionResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    document_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Interpret the submission response.
///
/// `completed` and `error` short-circuit; any other status (or none) means the
/// job is in progress and must carry a `document_id` to watch.
pub fn interpret_response(
    status: StatusCode,
    body: &[u8],
) -> Result<SubmissionResult, DeliveryError> {
    if !status.is_success() {
        return match serde_json::from_slice::<ErrorBody>(body) {
            Ok(e) if !e.error.trim().is_empty() => {
                tracing::debug!(%status, reason = %e.error, "backend rejected submission");
                Ok(SubmissionResult::Failed(e.error))
            }
            _ => {
                tracing::warn!(%status, "submission failed without a readable error body");
                Err(DeliveryError::transport())
            }
        };
    }

    let parsed: SubmissionResponse = serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "malformed submission response");
        DeliveryError::transport()
    })?;

    match parsed.status.as_deref() {
        Some("completed") => match parsed.result {
            Some(result) if !result.is_null() => {
                Ok(SubmissionResult::Completed(AnalysisPayload(result)))
            }
            _ => {
                tracing::warn!("completed response without a result");
                Err(DeliveryError::transport())
            }
        },
        Some("error") => Ok(SubmissionResult::Failed(
            DeliveryError::remote(parsed.error_message.filter(|m| !m.is_empty()))
                .user_message()
                .to_string(),
        )),
        other => match parsed.document_id.filter(|id| !id.trim().is_empty()) {
            Some(id) => {
                tracing::debug!(status = ?other, job_id = %id, "analysis in progress");
                Ok(SubmissionResult::Pending(id))
            }
            None => {
                tracing::warn!(status = ?other, "in-progress response without a document id");
                Err(DeliveryError::transport())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok(body: serde_json::Value) -> Result<SubmissionResult, DeliveryError> {
        interpret_response(StatusCode::OK, body.to_string().as_bytes())
    }

    #[test]
    fn completed_carries_payload() {
        let r = ok(json!({"status": "completed", "result": {"analysis_summary": "x"}}));
        assert_eq!(
            r,
            Ok(SubmissionResult::Completed(AnalysisPayload(
                json!({"analysis_summary": "x"})
            )))
        );
    }

    #[test]
    fn error_status_uses_message_or_default() {
        assert_eq!(
            ok(json!({"status": "error", "error_message": "no such ticker"})),
            Ok(SubmissionResult::Failed("no such ticker".into()))
        );
        assert_eq!(
            ok(json!({"status": "error"})),
            Ok(SubmissionResult::Failed("Analysis failed".into()))
        );
    }

    #[test]
    fn unknown_or_missing_status_watches_document() {
        assert_eq!(
            ok(json!({"status": "pending", "document_id": "doc123"})),
            Ok(SubmissionResult::Pending("doc123".into()))
        );
        assert_eq!(
            ok(json!({"document_id": "doc9"})),
            Ok(SubmissionResult::Pending("doc9".into()))
        );
    }

    #[test]
    fn completed_without_result_is_transport_error() {
        let generic = Err(DeliveryError::transport());
        assert_eq!(ok(json!({"status": "completed"})), generic);
        assert_eq!(ok(json!({"status": "completed", "result": null})), generic);
        assert_eq!(
            ok(json!({"status": "completed", "document_id": "doc1"})),
            generic
        );
    }

    #[test]
    fn pending_without_document_is_transport_error() {
        assert_eq!(
            ok(json!({"status": "processing"})),
            Err(DeliveryError::transport())
        );
    }

    #[test]
    fn non_success_with_error_body_is_remote_failure() {
        let r = interpret_response(
            StatusCode::BAD_REQUEST,
            br#"{"error": "Please provide a ticker symbol"}"#,
        );
        assert_eq!(
            r,
            Ok(SubmissionResult::Failed("Please provide a ticker symbol".into()))
        );
    }

    #[test]
    fn non_success_without_body_is_transport_error() {
        let r = interpret_response(StatusCode::BAD_GATEWAY, b"<html>bad gateway</html>");
        assert_eq!(r, Err(DeliveryError::transport()));
    }

    #[test]
    fn malformed_body_is_transport_error() {
        assert_eq!(
            interpret_response(StatusCode::OK, b"not json"),
            Err(DeliveryError::transport())
        );
    }
}
