//! Inbound cluster callback endpoint.
//!
//! The HMAC covers the exact raw request bytes, so this handler takes the
//! body as `Bytes` and only parses JSON after verification passes.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json as AxumJson;
use std::sync::Arc;

use crate::callbacks::{CallbackRejection, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::error::{AppError, AppResult};
use crate::metrics::metrics;
use crate::state::AppState;
use crate::types::CallbackPayload;
use crate::utils::now_unix;

pub async fn ingest_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<AxumJson<serde_json::Value>> {
    let signature = header_str(&headers, SIGNATURE_HEADER);
    let timestamp = header_str(&headers, TIMESTAMP_HEADER);

    if let Err(rejection) = state
        .verifier
        .verify(signature, timestamp, &body, now_unix())
    {
        metrics().callbacks_rejected_total.inc();
        return Err(map_rejection(rejection));
    }

    let payload: CallbackPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid callback payload: {e}")))?;

    let disposition = state.callbacks.apply(&payload);
    metrics().callbacks_accepted_total.inc();

    // Unknown ids are acked too; the cluster has nothing useful to retry.
    Ok(AxumJson(serde_json::json!({
        "success": true,
        "disposition": format!("{disposition:?}").to_lowercase(),
    })))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn map_rejection(rejection: CallbackRejection) -> AppError {
    match rejection {
        // A missing auth header is an auth failure, not a malformed request.
        CallbackRejection::MissingHeader(_)
        | CallbackRejection::StaleTimestamp { .. }
        | CallbackRejection::BadSignatureEncoding
        | CallbackRejection::SignatureMismatch => AppError::Unauthorized(rejection.to_string()),
        CallbackRejection::BadTimestamp => AppError::BadRequest(rejection.to_string()),
    }
}
