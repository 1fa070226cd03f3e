use crate::detection_store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced by the HTTP API.
///
/// Each variant maps to one status code and a fixed, caller-safe message.
/// The underlying cause is logged, never returned.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Detection not found")]
    NotFound,

    #[error("Uploaded file is too large")]
    PayloadTooLarge,

    #[error("Detection store is unavailable")]
    StorageUnavailable(#[source] StoreError),

    #[error("Failed to store uploaded file")]
    Io(#[from] std::io::Error),

    #[error("Detection queue is unavailable")]
    QueueUnavailable,

    #[error("Internal server error")]
    Internal(anyhow::Error),
}

/// Error body, `{"detail": "..."}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::StorageUnavailable(_) | ApiError::QueueUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Io(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => ApiError::StorageUnavailable(err),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            ApiError::Validation(_) | ApiError::NotFound | ApiError::PayloadTooLarge => {
                warn!(status = status.as_u16(), detail = %self, "Request rejected");
            }
            ApiError::StorageUnavailable(source) => {
                error!(error = %source, "Detection store unavailable");
            }
            ApiError::Io(source) => {
                error!(error = %source, "File storage failure");
            }
            ApiError::QueueUnavailable => {
                error!("Detection job queue rejected a job");
            }
            ApiError::Internal(source) => {
                error!(error = %source, "Internal error");
            }
        }

        let body = ErrorResponse {
            detail: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}
