//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes probes.
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health/ready - Readiness probe (ready to serve traffic)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::state::AppState;

/// GET /health/live
///
/// Returns 200 if the process is alive, no dependency checks.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// Returns 200 while the store answers and the pipeline accepts work.
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    if check_store_health(&state).await && !state.pipeline.is_shutting_down() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store_ok = check_store_health(&state).await;
    let pipeline_ok = !state.pipeline.is_shutting_down();

    let overall_status = match (store_ok, pipeline_ok) {
        (true, true) => "healthy",
        (false, false) => "unhealthy",
        _ => "degraded",
    };

    Json(HealthResponse {
        status: overall_status.to_string(),
        store: if store_ok { "ok" } else { "error" }.to_string(),
        pipeline: if pipeline_ok { "ok" } else { "stopping" }.to_string(),
        connections: state.hub.connection_count().await,
        queue_depth: state.pipeline.queue_depth(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn check_store_health(state: &AppState) -> bool {
    match state.pipeline.store().count_by_status(None, None).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Store health check failed");
            false
        }
    }
}
