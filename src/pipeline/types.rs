//! Request and response types for pipeline operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Event, EventId, Priority, UNKNOWN_SOURCE};

/// One event as submitted by a publisher
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Default::default()
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Build the pending event. Source falls back to the caller's header,
    /// then to "unknown".
    pub(crate) fn into_event(self, source_header: Option<&str>) -> Event {
        let source = self
            .source
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                source_header
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| UNKNOWN_SOURCE.to_string());

        let mut event = Event::new(self.event_type.trim(), source)
            .priority(self.priority.unwrap_or_default());
        if let Some(payload) = self.payload.filter(|p| !p.is_null()) {
            event = event.payload(payload);
        }
        event
    }
}

/// Overrides for one retry
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryOptions {
    pub max_attempts: Option<u32>,
    pub delay_seconds: Option<u64>,
}

/// Parameters of a retry request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryParams {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub retry_options: Option<RetryOptions>,
}

/// Acknowledgement that a retry was scheduled
#[derive(Debug, Clone, Serialize)]
pub struct RetryTicket {
    pub retry_id: String,
    pub event_id: EventId,
    /// Retry count after this retry was accepted
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// A retry waiting for its due time
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledRetry {
    pub retry_id: String,
    pub event_id: EventId,
    pub scheduled_at: DateTime<Utc>,
}
