//! Direct computation lookups against the cluster, for clients that want
//! status without waiting for the callback.

use axum::extract::{Path, State};
use axum::Json as AxumJson;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;

use crate::error::AppResult;
use crate::state::AppState;
use crate::types::StatusResponse;

pub async fn computation_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<StatusResponse>> {
    let status = state.cluster.poll_status(&id).await?;
    Ok(AxumJson(status))
}

/// Block (bounded by the configured timeout) until the computation reaches a
/// terminal status.
pub async fn await_computation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<serde_json::Value>> {
    let outcome = state
        .cluster
        .await_completion(
            &id,
            state.cfg.computation_timeout_ms,
            state.cfg.poll_interval_ms,
        )
        .await?;
    Ok(AxumJson(serde_json::json!({
        "computation_id": outcome.computation_id,
        "status": outcome.status,
        "result": outcome.result.map(|r| BASE64.encode(r)),
        "error": outcome.error,
        "completed_at": outcome.completed_at,
    })))
}
