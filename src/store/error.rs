//! Event store error types

use thiserror::Error;

/// Errors that can occur in the event store
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite returned an error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored row could not be decoded into an event
    #[error("Corrupt record {id}: {reason}")]
    Corruption { id: String, reason: String },

    /// Pagination cursor was not produced by this store
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::Corruption {
            id: "abc".to_string(),
            reason: "bad status".to_string(),
        };
        assert_eq!(err.to_string(), "Corrupt record abc: bad status");
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let store_err: StoreError = json_err.into();
        assert!(matches!(store_err, StoreError::Serialization(_)));
    }
}
