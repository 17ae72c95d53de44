use axum::extract::State;
use axum::Json as AxumJson;
use std::sync::Arc;

use crate::error::AppResult;
use crate::state::AppState;
use crate::store::SettlementStore as _;

pub async fn health() -> AxumJson<serde_json::Value> {
    AxumJson(serde_json::json!({ "status": "ok" }))
}

pub async fn readiness(
    State(state): State<Arc<AppState>>,
) -> AppResult<AxumJson<serde_json::Value>> {
    Ok(AxumJson(serde_json::json!({
        "status": "ok",
        "cluster_url": state.cfg.cluster_url,
        "callback_url_configured": state.cfg.callback_url.is_some(),
        "batch_settlement_enabled": state.batches.is_some(),
        "tracked_intents": state.store.list_intents(None).len(),
    })))
}
