//! # Eventhub
//!
//! Real-time event hub: clients publish events over HTTP, connected
//! WebSocket sessions receive them as they land, and a worker pool drives
//! each event through processing with delayed, cancellable retries.
//!
//! ## Modules
//!
//! - [`store`]: Event persistence (SQLite) behind the [`EventStore`] trait
//! - [`websocket`]: Connection hub, session pumps and frame formats
//! - [`pipeline`]: Publish, process, retry and maintenance operations
//! - [`stats`]: Realtime counters and search
//! - [`api`]: REST and WebSocket endpoints with Axum
//! - [`config`]: TOML configuration with `EVENTHUB_*` overrides
//! - [`logging`]: `tracing` subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eventhub::pipeline::{DefaultProcessor, EventPipeline, NewEvent, PipelineConfig};
//! use eventhub::store::SqliteEventStore;
//! use eventhub::websocket::{ConnectionHub, HubConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(SqliteEventStore::in_memory()?);
//!     let hub = Arc::new(ConnectionHub::new(HubConfig::default()));
//!     let pipeline = EventPipeline::new(
//!         store,
//!         hub,
//!         Arc::new(DefaultProcessor::default()),
//!         PipelineConfig::default(),
//!     );
//!
//!     let event = pipeline
//!         .publish(NewEvent::new("user_action").source("web"), None)
//!         .await?;
//!     println!("Published {}", event.id);
//!
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod logging;
pub mod pipeline;
pub mod stats;
pub mod store;
pub mod websocket;

pub use api::{build_router, serve, ApiConfig, ApiError, AppState};
pub use config::{Config, ConfigError, LoggingConfig};
pub use pipeline::{
    DefaultProcessor, EventPipeline, EventProcessor, NewEvent, PipelineConfig, PipelineError,
    ProcessingError,
};
pub use stats::{RealtimeStats, SearchRequest, StatsFacade, StatsInterval};
pub use store::{Event, EventId, EventStatus, EventStore, Priority, SqliteEventStore, StoreError};
pub use websocket::{ClientMessage, ConnectionHub, HubConfig, HubError, ServerMessage};
