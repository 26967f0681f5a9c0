//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::pipeline::EventPipeline;
use crate::stats::StatsFacade;
use crate::websocket::ConnectionHub;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Publish, processing and maintenance operations
    pub pipeline: Arc<EventPipeline>,
    /// WebSocket connection hub
    pub hub: Arc<ConnectionHub>,
    /// Realtime stats and search
    pub stats: Arc<StatsFacade>,
    /// API configuration
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    /// Build state around a running pipeline; the hub is the pipeline's own
    pub fn new(pipeline: Arc<EventPipeline>, config: ApiConfig) -> Self {
        Self {
            hub: Arc::clone(pipeline.hub()),
            stats: Arc::new(StatsFacade::new(Arc::clone(&pipeline))),
            pipeline,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

impl ApiConfig {
    /// Create config with custom host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
