use axum::extract::{Path, State};
use axum::Json as AxumJson;
use std::sync::Arc;

use crate::error::AppResult;
use crate::state::AppState;
use crate::types::{CreateTransferRequest, TransferRecord};

pub async fn create_transfer(
    State(state): State<Arc<AppState>>,
    AxumJson(req): AxumJson<CreateTransferRequest>,
) -> AppResult<AxumJson<TransferRecord>> {
    Ok(AxumJson(state.orchestrator.create_transfer(req).await?))
}

pub async fn get_transfer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<AxumJson<TransferRecord>> {
    Ok(AxumJson(state.orchestrator.get_transfer(&id)?))
}
