use axum::response::IntoResponse;
use axum::Json as AxumJson;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal Error: {0}")]
    Internal(String),
    #[error("Bad Gateway: {0}")]
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg) = match self {
            AppError::BadRequest(m) => (axum::http::StatusCode::BAD_REQUEST, m),
            AppError::Unauthorized(m) => (axum::http::StatusCode::UNAUTHORIZED, m),
            AppError::NotFound(m) => (axum::http::StatusCode::NOT_FOUND, m),
            AppError::Conflict(m) => (axum::http::StatusCode::CONFLICT, m),
            AppError::Internal(m) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, m),
            AppError::BadGateway(m) => (axum::http::StatusCode::BAD_GATEWAY, m),
        };
        let body = serde_json::json!({ "error": msg });
        (status, AxumJson(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
