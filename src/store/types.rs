//! Core data types for the event store
//!
//! - `Event`: A published application event and its processing state
//! - `EventStatus`: The persisted states of the processing state machine
//! - `Priority`: Delivery priority attached by the publisher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for an event
pub type EventId = String;

/// Source recorded when neither the body nor the caller supplies one
pub const UNKNOWN_SOURCE: &str = "unknown";

/// A published application event
///
/// `created_at` and `processed_at` carry millisecond precision so that the
/// value handed back on publish is identical to what a later read returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: EventId,
    /// Application-defined event type (never empty once persisted)
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    /// Opaque structured document
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

impl Event {
    /// Create a new pending event with a fresh id
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            payload: serde_json::Value::Object(Default::default()),
            priority: Priority::Normal,
            status: EventStatus::Pending,
            created_at: now_millis(),
            processed_at: None,
            retry_count: 0,
            error_message: None,
        }
    }

    /// Builder method: set the payload
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Builder method: set the priority
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method: set the status
    pub fn status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder method: set the retry count
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Persisted processing status
///
/// ```text
/// pending ──► processed
///    │
///    └──────► failed ──► retry ──► processed | failed
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processed,
    Failed,
    Retry,
}

impl EventStatus {
    /// Get all statuses for iteration
    pub fn all() -> &'static [EventStatus] {
        &[
            EventStatus::Pending,
            EventStatus::Processed,
            EventStatus::Failed,
            EventStatus::Retry,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
            EventStatus::Retry => "retry",
        }
    }

    /// Whether a processing job may run against an event in this status
    pub fn is_processable(&self) -> bool {
        matches!(self, EventStatus::Pending | EventStatus::Retry)
    }

    /// Whether a manual retry may be requested from this status
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStatus::Failed | EventStatus::Retry)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processed" => Ok(EventStatus::Processed),
            "failed" => Ok(EventStatus::Failed),
            "retry" => Ok(EventStatus::Retry),
            _ => Err(format!(
                "Invalid status: {}. Use pending, processed, failed, or retry",
                s
            )),
        }
    }
}

/// Publisher-assigned priority
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(format!(
                "Invalid priority: {}. Use low, normal, high, or urgent",
                s
            )),
        }
    }
}

/// Current time truncated to millisecond precision
pub fn now_millis() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

/// Convert epoch milliseconds into a UTC timestamp
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_defaults() {
        let event = Event::new("user_action", "web_app");
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.priority, Priority::Normal);
        assert_eq!(event.retry_count, 0);
        assert!(event.processed_at.is_none());
        assert_eq!(event.created_at.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("failed".parse::<EventStatus>(), Ok(EventStatus::Failed));
        assert!("invalid_status".parse::<EventStatus>().is_err());
        assert!("processing".parse::<EventStatus>().is_err());
    }

    #[test]
    fn test_status_rules() {
        assert!(EventStatus::Pending.is_processable());
        assert!(EventStatus::Retry.is_processable());
        assert!(!EventStatus::Processed.is_processable());
        assert!(EventStatus::Failed.is_retryable());
        assert!(!EventStatus::Processed.is_retryable());
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = Event::new("user_action", "web_app").priority(Priority::Urgent);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "user_action");
        assert_eq!(json["priority"], "urgent");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn test_priority_parse_case_insensitive() {
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert!("critical".parse::<Priority>().is_err());
    }
}
