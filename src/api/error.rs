//! API Error Types
//!
//! Defines error types for the API layer and implements conversion
//! to HTTP responses with appropriate status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::PipelineError;
use crate::store::StoreError;

/// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    /// Request validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller could not be identified
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the resource's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Retry budget used up
    #[error("Retry exhausted: {0}")]
    RetryExhausted(String),

    /// Storage layer error; details are logged, not returned
    #[error("Storage error")]
    Storage(#[source] StoreError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Server is draining
    #[error("Service is shutting down")]
    ShuttingDown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(message) => ApiError::Validation(message),
            PipelineError::NotFound(message) => ApiError::NotFound(message),
            e @ (PipelineError::InvalidState { .. } | PipelineError::Busy(_)) => {
                ApiError::InvalidState(e.to_string())
            }
            e @ PipelineError::RetryExhausted { .. } => ApiError::RetryExhausted(e.to_string()),
            PipelineError::Storage(e) => ApiError::Storage(e),
            PipelineError::ShuttingDown => ApiError::ShuttingDown,
        }
    }
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    pub request_id: String,
}

/// Error details
#[derive(Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::InvalidState(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
            ApiError::RetryExhausted(_) => (StatusCode::UNPROCESSABLE_ENTITY, "RETRY_EXHAUSTED"),
            ApiError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            let detail = match &self {
                ApiError::Storage(e) => e.to_string(),
                other => other.to_string(),
            };
            tracing::error!(
                request_id = %request_id,
                error_code = %code,
                error_message = %detail,
                "API error occurred"
            );
        } else {
            tracing::debug!(
                request_id = %request_id,
                error_code = %code,
                error_message = %self,
                "Request rejected"
            );
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: self.to_string(),
            },
            request_id,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventStatus;

    #[test]
    fn test_pipeline_error_mapping() {
        let cases = [
            (
                PipelineError::Validation("bad".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                PipelineError::NotFound("gone".to_string()),
                StatusCode::NOT_FOUND,
            ),
            (
                PipelineError::InvalidState {
                    id: "e".to_string(),
                    status: EventStatus::Processed,
                },
                StatusCode::CONFLICT,
            ),
            (
                PipelineError::RetryExhausted {
                    id: "e".to_string(),
                    attempts: 3,
                    max_attempts: 3,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                PipelineError::Storage(StoreError::Lock("poisoned".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (PipelineError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (err, expected) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.into_response().status(), expected);
        }
    }

    #[test]
    fn test_storage_message_is_generic() {
        let err = ApiError::Storage(StoreError::Lock("secret path /var/db".to_string()));
        assert_eq!(err.to_string(), "Storage error");
    }
}
