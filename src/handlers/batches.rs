//! Batch settlement endpoints.
//!
//! The escalation engine and its ledger ports are synchronous, so every
//! ledger-touching operation runs on the blocking pool.

use axum::extract::{Path, Query, State};
use axum::Json as AxumJson;
use serde::Deserialize;
use std::sync::Arc;

use crate::batch::{estimate_cost, BatchEntry, BatchEscalation, BatchSettlement};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateBatchRequest {
    pub sender: String,
    pub entries: Vec<BatchEntry>,
}

#[derive(Deserialize)]
pub struct EstimateQuery {
    pub recipients: u32,
}

fn escalation(state: &AppState) -> AppResult<Arc<BatchEscalation>> {
    state
        .batches
        .clone()
        .ok_or_else(|| AppError::BadRequest("batch settlement is not configured".into()))
}

async fn run_blocking<T, F>(op: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| AppError::Internal(format!("batch task panicked: {e}")))?
}

pub async fn estimate(Query(q): Query<EstimateQuery>) -> AxumJson<serde_json::Value> {
    AxumJson(serde_json::json!({
        "recipients": q.recipients,
        "estimated_cost_minor": estimate_cost(q.recipients),
    }))
}

pub async fn create_batch(
    State(state): State<Arc<AppState>>,
    AxumJson(req): AxumJson<CreateBatchRequest>,
) -> AppResult<AxumJson<BatchSettlement>> {
    let esc = escalation(&state)?;
    let batch = run_blocking(move || esc.create(&req.sender, &req.entries)).await?;
    Ok(AxumJson(batch))
}

pub async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<BatchSettlement>> {
    Ok(AxumJson(escalation(&state)?.get(&id)?))
}

pub async fn delegate_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<BatchSettlement>> {
    let esc = escalation(&state)?;
    Ok(AxumJson(run_blocking(move || esc.delegate(&id)).await?))
}

pub async fn process_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<BatchSettlement>> {
    let esc = escalation(&state)?;
    Ok(AxumJson(run_blocking(move || esc.process(&id)).await?))
}

pub async fn finalize_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<BatchSettlement>> {
    let esc = escalation(&state)?;
    Ok(AxumJson(run_blocking(move || esc.finalize(&id)).await?))
}

pub async fn cancel_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<BatchSettlement>> {
    let esc = escalation(&state)?;
    Ok(AxumJson(run_blocking(move || esc.cancel(&id)).await?))
}
