use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    CausalNotReady,
    Upstream(String),
    Config(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::CausalNotReady => {
                write!(f, "Causal dependencies not satisfied; try again later")
            }
            AppError::Upstream(msg) => write!(f, "Upstream replica error: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::CausalNotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Causal dependencies not satisfied; try again later".to_string(),
            ),
            AppError::Upstream(msg) => {
                tracing::warn!("Relay to owning shard failed: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Owning shard did not respond; try again later".to_string(),
                )
            }
            AppError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        let body = Json(json!({ "error": error_message }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
