//! Eventhub REST API
//!
//! HTTP API layer for the event hub, built with Axum.
//!
//! # Endpoints
//!
//! ## Events
//! - `POST /events` - Publish one event
//! - `POST /events/batch` - Publish up to 100 events
//! - `DELETE /events/batch` - Delete up to 100 events
//! - `GET /events` - List events (also `GET /rt/events`)
//! - `GET /events/:id` - Get an event
//! - `DELETE /events/:id` - Delete an event
//! - `POST /events/:id/retry` - Schedule a retry of a failed event
//! - `PUT /events/:id/status` - Set an event's status
//! - `GET /events/failed` - Failed events
//! - `POST /events/process` - Process pending events now
//! - `GET /events/retries` - Scheduled retries
//! - `DELETE /events/retries/:retry_id` - Cancel a scheduled retry
//!
//! ## Stats and Search
//! - `GET /stats/realtime` - Counts and rates over a recent window
//! - `POST /search` - Search with filters and aggregations
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! ## WebSocket
//! - `GET /rt/ws` - Real-time event stream (requires `X-User-Id`)
//!
//! # Example
//!
//! ```rust,ignore
//! use eventhub::api::{serve, ApiConfig, AppState};
//! use eventhub::pipeline::{DefaultProcessor, EventPipeline, PipelineConfig};
//! use eventhub::store::SqliteEventStore;
//! use eventhub::websocket::{ConnectionHub, HubConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(SqliteEventStore::open(std::path::Path::new("events.db"))?);
//!     let hub = Arc::new(ConnectionHub::new(HubConfig::default()));
//!     let pipeline = Arc::new(EventPipeline::new(
//!         store,
//!         hub,
//!         Arc::new(DefaultProcessor::default()),
//!         PipelineConfig::default(),
//!     ));
//!
//!     let config = ApiConfig::default();
//!     serve(AppState::new(pipeline, config.clone()), &config).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{ApiConfig, AppState};

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::websocket::websocket_handler;

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let event_routes = Router::new()
        .route(
            "/",
            get(routes::events::list_events).post(routes::events::publish_event),
        )
        .route(
            "/batch",
            post(routes::events::publish_batch).delete(routes::events::delete_batch),
        )
        .route("/failed", get(routes::events::failed_events))
        .route("/process", post(routes::events::process_pending))
        .route("/retries", get(routes::events::list_retries))
        .route("/retries/:retry_id", delete(routes::events::cancel_retry))
        .route(
            "/:id",
            get(routes::events::get_event).delete(routes::events::delete_event),
        )
        .route("/:id/retry", post(routes::events::retry_event))
        .route("/:id/status", put(routes::events::update_status));

    let realtime_routes = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/events", get(routes::events::list_events));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let body_limit = state.config.max_body_size;
    let shared_state = Arc::new(state);

    Router::new()
        .nest("/events", event_routes)
        .nest("/rt", realtime_routes)
        .nest("/health", health_routes)
        .route("/search", post(routes::stats::search))
        .route("/stats/realtime", get(routes::stats::realtime_stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(shared_state)
}

/// Start the API server
///
/// On SIGINT/SIGTERM the hub closes every session so upgraded connections
/// let the server drain; the pipeline is stopped once it has.
pub async fn serve(state: AppState, config: &ApiConfig) -> Result<(), ApiError> {
    let hub = Arc::clone(&state.hub);
    let pipeline = Arc::clone(&state.pipeline);
    let router = build_router(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(addr = %addr, "Eventhub API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            hub.shutdown().await;
        })
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    pipeline.shutdown().await;

    tracing::info!("Eventhub API shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
