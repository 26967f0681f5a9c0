//! Stats and Search Routes
//!
//! - GET /stats/realtime - Counts and rates over a recent window
//! - POST /search - Filtered search with aggregations

use axum::{
    extract::{Query, State},
    Json,
};
use std::sync::Arc;

use crate::api::dto::StatsParams;
use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::stats::{RealtimeStats, SearchRequest};
use crate::store::SearchResult;

/// GET /stats/realtime
pub async fn realtime_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> ApiResult<Json<RealtimeStats>> {
    let stats = state
        .stats
        .realtime_stats(params.interval.as_deref(), params.event_type.as_deref())
        .await?;
    Ok(Json(stats))
}

/// POST /search
pub async fn search(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Json<SearchResult>> {
    Ok(Json(state.stats.search(req).await?))
}
