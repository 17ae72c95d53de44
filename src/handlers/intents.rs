use axum::extract::{Path, Query, State};
use axum::Json as AxumJson;
use std::sync::Arc;

use crate::error::AppResult;
use crate::state::AppState;
use crate::types::{
    CreateIntentRequest, ListIntentsQuery, ListIntentsResponse, PaymentIntent,
    UpdateIntentRequest,
};

pub async fn create_intent(
    State(state): State<Arc<AppState>>,
    AxumJson(req): AxumJson<CreateIntentRequest>,
) -> AppResult<AxumJson<PaymentIntent>> {
    let intent = state.orchestrator.create(req).await?;
    Ok(AxumJson(intent))
}

pub async fn list_intents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListIntentsQuery>,
) -> AppResult<AxumJson<ListIntentsResponse>> {
    Ok(AxumJson(state.orchestrator.list(&query)))
}

pub async fn get_intent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<PaymentIntent>> {
    Ok(AxumJson(state.orchestrator.get(&id)?))
}

pub async fn update_intent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AxumJson(req): AxumJson<UpdateIntentRequest>,
) -> AppResult<AxumJson<PaymentIntent>> {
    Ok(AxumJson(state.orchestrator.update(&id, req)?))
}

pub async fn confirm_intent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<PaymentIntent>> {
    Ok(AxumJson(state.orchestrator.confirm(&id).await?))
}

pub async fn cancel_intent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<PaymentIntent>> {
    Ok(AxumJson(state.orchestrator.cancel(&id)?))
}

/// Failed background submissions, newest last. Operational visibility for
/// what the fire-and-forget path dropped.
pub async fn dead_letters(
    State(state): State<Arc<AppState>>,
) -> AppResult<AxumJson<serde_json::Value>> {
    let entries = state.orchestrator.dead_letters();
    Ok(AxumJson(serde_json::json!({
        "count": entries.len(),
        "entries": entries,
    })))
}
