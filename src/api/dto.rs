//! Data Transfer Objects
//!
//! Request and response types for the API endpoints.
//! These types are serialized/deserialized to/from JSON.

use serde::{Deserialize, Serialize};

use crate::pipeline::NewEvent;
use crate::store::{Event, EventId};

// ============================================
// EVENT DTOs
// ============================================

/// Body of `POST /events`
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub event: NewEvent,
}

/// Body of `POST /events/batch`
#[derive(Debug, Deserialize)]
pub struct BatchPublishRequest {
    pub events: Vec<NewEvent>,
}

/// Body of `DELETE /events/batch`
#[derive(Debug, Deserialize)]
pub struct DeleteBatchRequest {
    pub ids: Vec<EventId>,
}

/// Result of a batch delete
#[derive(Debug, Serialize)]
pub struct DeleteBatchResponse {
    /// Number of ids in the request
    pub requested: usize,
    /// Number of events that existed and were removed
    pub deleted: usize,
}

/// Body of `PUT /events/{id}/status`
#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// A list of events with its length
#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub count: usize,
    pub events: Vec<Event>,
}

impl From<Vec<Event>> for EventsResponse {
    fn from(events: Vec<Event>) -> Self {
        Self {
            count: events.len(),
            events,
        }
    }
}

/// Query string of `GET /events`
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub status: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub direction: Option<String>,
}

/// `?limit=` for endpoints that only take a limit
#[derive(Debug, Default, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

// ============================================
// STATS DTOs
// ============================================

/// Query string of `GET /stats/realtime`
#[derive(Debug, Default, Deserialize)]
pub struct StatsParams {
    pub interval: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", "unhealthy"
    pub status: String,
    /// Store status
    pub store: String,
    /// Pipeline status
    pub pipeline: String,
    /// Live WebSocket sessions
    pub connections: usize,
    /// Jobs waiting for a worker
    pub queue_depth: usize,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// API version
    pub version: String,
}
