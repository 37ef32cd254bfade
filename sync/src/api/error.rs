//! Unified error handling for the local API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::SyncError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,
}

impl From<tally_engine::Error> for AppError {
    fn from(e: tally_engine::Error) -> Self {
        AppError::Sync(SyncError::Engine(e))
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::Sync(SyncError::Engine(e)) if e.is_validation() => {
                (StatusCode::BAD_REQUEST, e.to_string(), None)
            }
            AppError::Sync(SyncError::Engine(e @ tally_engine::Error::RecordNotFound(_))) => {
                (StatusCode::NOT_FOUND, e.to_string(), None)
            }
            AppError::Sync(SyncError::Remote(e)) => {
                tracing::warn!("Remote error: {:?}", e);
                let status = if e.is_retryable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, "Remote store error".to_string(), Some(e.to_string()))
            }
            AppError::Sync(e) => {
                tracing::error!("Storage error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
