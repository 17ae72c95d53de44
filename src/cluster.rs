//! HTTP client for the MPC cluster.
//!
//! Submission and status polling against `POST /computations` and
//! `GET /computations/{id}`. Transport failures are retryable; cluster
//! rejections are not, and carry whether the failure was an auth problem or a
//! malformed request so callers can route them differently.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;
use tracing::warn;

use crate::types::{ComputationRequest, ComputationStatus, StatusResponse, SubmitBody, SubmitResponse};

#[derive(Debug, Error)]
pub enum ClusterError {
    /// Transport-level failure. Safe to retry.
    #[error("cluster unreachable: {0}")]
    Network(String),
    /// The cluster refused the request. Not retryable as-is.
    #[error("cluster rejected request ({status}): {message}")]
    Rejected {
        status: u16,
        auth: bool,
        message: String,
    },
    /// The cluster answered with something we cannot interpret.
    #[error("cluster protocol error: {0}")]
    Protocol(String),
    /// The computation finished unsuccessfully on the cluster side.
    #[error("computation failed: {reason}")]
    Failed { reason: String },
    /// `await_completion` exhausted its deadline without a terminal status.
    #[error("computation still pending after {waited_ms}ms")]
    Timeout { waited_ms: u64 },
}

impl ClusterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout { .. })
    }
}

impl From<ClusterError> for crate::error::AppError {
    fn from(err: ClusterError) -> Self {
        use crate::error::AppError;
        match &err {
            ClusterError::Rejected { auth: true, .. } => AppError::Unauthorized(err.to_string()),
            ClusterError::Rejected { .. } => AppError::BadRequest(err.to_string()),
            ClusterError::Failed { .. } => AppError::Conflict(err.to_string()),
            ClusterError::Network(_) | ClusterError::Protocol(_) | ClusterError::Timeout { .. } => {
                AppError::BadGateway(err.to_string())
            }
        }
    }
}

/// Terminal outcome of an awaited computation.
#[derive(Debug, Clone)]
pub struct ComputationOutcome {
    pub computation_id: String,
    pub status: ComputationStatus,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub completed_at: Option<i64>,
}

#[derive(Clone)]
pub struct ClusterClient {
    http: reqwest::Client,
    base_url: String,
}

impl ClusterClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    pub async fn submit(&self, request: &ComputationRequest) -> Result<SubmitResponse, ClusterError> {
        let body = SubmitBody {
            computation_type: request.computation_type.clone(),
            encrypted_inputs: request
                .encrypted_inputs
                .iter()
                .map(|e| BASE64.encode(e))
                .collect(),
            user_pubkey: request.counterparty_id.clone(),
            metadata: request.metadata.clone(),
            callback_url: request.callback_url.clone(),
            reference_id: request.correlation_id.clone(),
        };
        let url = format!("{}/computations", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClusterError::Network(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ClusterError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_rejection(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| ClusterError::Protocol(format!("bad submit response: {e}")))
    }

    pub async fn poll_status(&self, computation_id: &str) -> Result<StatusResponse, ClusterError> {
        let url = format!("{}/computations/{computation_id}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ClusterError::Network(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ClusterError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_rejection(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| ClusterError::Protocol(format!("bad status response: {e}")))
    }

    /// Poll until the computation reaches a terminal status or `timeout_ms`
    /// elapses. Transient network errors during polling are logged and
    /// retried within the same deadline. There is no cancellation path here;
    /// a timeout leaves the computation running on the cluster.
    pub async fn await_completion(
        &self,
        computation_id: &str,
        timeout_ms: u64,
        poll_interval_ms: u64,
    ) -> Result<ComputationOutcome, ClusterError> {
        let mut waited_ms = 0u64;
        loop {
            match self.poll_status(computation_id).await {
                Ok(status) => {
                    let mapped = ComputationStatus::from_wire(&status.status).ok_or_else(|| {
                        ClusterError::Protocol(format!("unknown status {:?}", status.status))
                    })?;
                    match mapped {
                        ComputationStatus::Failed => {
                            return Err(ClusterError::Failed {
                                reason: status
                                    .error
                                    .unwrap_or_else(|| "unspecified cluster failure".into()),
                            });
                        }
                        ComputationStatus::Succeeded | ComputationStatus::Cancelled => {
                            let result = match status.result.as_deref() {
                                Some(b64) => Some(BASE64.decode(b64).map_err(|e| {
                                    ClusterError::Protocol(format!("bad result encoding: {e}"))
                                })?),
                                None => None,
                            };
                            return Ok(ComputationOutcome {
                                computation_id: status.computation_id,
                                status: mapped,
                                result,
                                error: status.error,
                                completed_at: status.completed_at,
                            });
                        }
                        ComputationStatus::Queued | ComputationStatus::Running => {}
                    }
                }
                Err(err) if err.is_retryable() => {
                    warn!(computation_id, error = %err, "status poll failed, retrying");
                }
                Err(err) => return Err(err),
            }
            if waited_ms >= timeout_ms {
                return Err(ClusterError::Timeout { waited_ms });
            }
            tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await;
            waited_ms = waited_ms.saturating_add(poll_interval_ms);
        }
    }
}

fn classify_rejection(status: reqwest::StatusCode, body: &str) -> ClusterError {
    let message = extract_error_message(body);
    if status.is_client_error() {
        ClusterError::Rejected {
            status: status.as_u16(),
            auth: matches!(status.as_u16(), 401 | 403),
            message,
        }
    } else {
        // 5xx: the cluster is unhealthy, treat like a transport failure.
        ClusterError::Network(format!("cluster returned {status}: {message}"))
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(|e| e.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "no error body".into()
            } else {
                trimmed.chars().take(256).collect()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn auth_rejections_are_flagged() {
        let err = classify_rejection(StatusCode::UNAUTHORIZED, r#"{"error":"bad key"}"#);
        match err {
            ClusterError::Rejected { auth, message, .. } => {
                assert!(auth);
                assert_eq!(message, "bad key");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!classify_rejection(StatusCode::UNAUTHORIZED, "{}").is_retryable());
    }

    #[test]
    fn malformed_rejections_are_not_auth() {
        let err = classify_rejection(StatusCode::UNPROCESSABLE_ENTITY, r#"{"message":"bad input"}"#);
        match err {
            ClusterError::Rejected { auth, .. } => assert!(!auth),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = classify_rejection(StatusCode::BAD_GATEWAY, "upstream down");
        assert!(err.is_retryable());
    }

    #[test]
    fn error_message_falls_back_to_raw_body() {
        assert_eq!(extract_error_message("plain text"), "plain text");
        assert_eq!(extract_error_message(""), "no error body");
    }
}
