//! Pipeline error types

use thiserror::Error;

use crate::store::{EventStatus, StoreError};

/// Errors returned by synchronous pipeline operations
///
/// Failures inside asynchronous processing never surface here; they are
/// recorded on the event itself.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing or oversized input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown event or retry id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not allowed from the event's current status
    #[error("Event {id} cannot be retried from status '{status}'")]
    InvalidState { id: String, status: EventStatus },

    /// Another unit is processing or retrying the event right now
    #[error("Event {0} is busy, try again")]
    Busy(String),

    /// Retry budget used up
    #[error("Event {id} has exhausted its retries ({attempts}/{max_attempts})")]
    RetryExhausted {
        id: String,
        attempts: u32,
        max_attempts: u32,
    },

    /// Persistence failure
    #[error("Storage error: {0}")]
    Storage(StoreError),

    /// The pipeline is stopping and accepts no new work
    #[error("Pipeline is shutting down")]
    ShuttingDown,
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidCursor(cursor) => {
                PipelineError::Validation(format!("Invalid cursor: {}", cursor))
            }
            other => PipelineError::Storage(other),
        }
    }
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
