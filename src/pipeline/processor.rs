//! Pluggable processing step
//!
//! The pipeline calls an [`EventProcessor`] once per processing attempt.
//! `Ok` moves the event to `processed`; `Err` moves it to `failed` with the
//! error text recorded.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::store::Event;

/// Failure reported by a processor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProcessingError(pub String);

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Business logic run for each event
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, event: &Event) -> Result<(), ProcessingError>;
}

/// Succeeds for every event after a short fixed delay
#[derive(Debug, Clone)]
pub struct DefaultProcessor {
    delay: Duration,
}

impl DefaultProcessor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for DefaultProcessor {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl EventProcessor for DefaultProcessor {
    async fn process(&self, event: &Event) -> Result<(), ProcessingError> {
        tracing::trace!(event_id = %event.id, event_type = %event.event_type, "Processing event");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_processor_succeeds() {
        let processor = DefaultProcessor::new(Duration::ZERO);
        let event = Event::new("click", "web");
        assert!(processor.process(&event).await.is_ok());
    }

    #[test]
    fn test_processing_error_display() {
        assert_eq!(ProcessingError::new("boom").to_string(), "boom");
    }
}
