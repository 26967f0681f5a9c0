//! Event Routes
//!
//! - POST /events - Publish one event
//! - POST /events/batch - Publish up to 100 events
//! - DELETE /events/batch - Delete up to 100 events
//! - GET /events, /rt/events - List with filters and cursor
//! - GET /events/:id - Fetch one event
//! - DELETE /events/:id - Delete one event
//! - POST /events/:id/retry - Schedule a retry
//! - PUT /events/:id/status - Set status manually
//! - GET /events/failed - Failed events
//! - POST /events/process - Process pending events now
//! - GET /events/retries - Scheduled retries
//! - DELETE /events/retries/:retry_id - Cancel a scheduled retry

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use crate::api::dto::{
    BatchPublishRequest, DeleteBatchRequest, DeleteBatchResponse, EventsResponse, LimitParams,
    ListParams, PublishRequest, UpdateStatusRequest,
};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::pipeline::{RetryParams, RetryTicket, ScheduledRetry};
use crate::store::{Direction, Event, EventPage, EventStatus, ListQuery};

/// Header naming the publisher when the body does not
pub const EVENT_SOURCE_HEADER: &str = "x-event-source";

const LIST_DEFAULT_LIMIT: usize = 50;
const LIST_MAX_LIMIT: usize = 500;
const FAILED_DEFAULT_LIMIT: usize = 50;
const FAILED_MAX_LIMIT: usize = 200;
const PROCESS_DEFAULT_LIMIT: usize = 10;
const PROCESS_MAX_LIMIT: usize = 50;

fn source_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(EVENT_SOURCE_HEADER)
        .and_then(|value| value.to_str().ok())
}

/// Apply the default, reject zero, cap at `max`
fn bounded_limit(limit: Option<usize>, default: usize, max: usize) -> ApiResult<usize> {
    match limit {
        None => Ok(default),
        Some(0) => Err(ApiError::Validation(
            "limit must be greater than zero".to_string(),
        )),
        Some(n) => Ok(n.min(max)),
    }
}

/// POST /events
pub async fn publish_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PublishRequest>,
) -> ApiResult<(StatusCode, Json<Event>)> {
    let event = state
        .pipeline
        .publish(req.event, source_header(&headers))
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// POST /events/batch
pub async fn publish_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<BatchPublishRequest>,
) -> ApiResult<(StatusCode, Json<EventsResponse>)> {
    let events = state
        .pipeline
        .publish_batch(req.events, source_header(&headers))
        .await?;
    Ok((StatusCode::CREATED, Json(events.into())))
}

/// DELETE /events/batch
pub async fn delete_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteBatchRequest>,
) -> ApiResult<Json<DeleteBatchResponse>> {
    let deleted = state.pipeline.delete_batch(&req.ids).await?;
    Ok(Json(DeleteBatchResponse {
        requested: req.ids.len(),
        deleted,
    }))
}

/// GET /events
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<EventPage>> {
    let limit = bounded_limit(params.limit, LIST_DEFAULT_LIMIT, LIST_MAX_LIMIT)?;
    let mut query = ListQuery::new(limit);

    if let Some(event_type) = params.event_type.filter(|t| !t.is_empty()) {
        query = query.event_type(event_type);
    }
    if let Some(source) = params.source.filter(|s| !s.is_empty()) {
        query = query.source(source);
    }
    if let Some(status) = params.status.filter(|s| !s.is_empty()) {
        let status: EventStatus = status.parse().map_err(ApiError::Validation)?;
        query = query.status(status);
    }
    if let Some(cursor) = params.cursor.filter(|c| !c.is_empty()) {
        query = query.cursor(cursor);
    }
    if let Some(direction) = params.direction.filter(|d| !d.is_empty()) {
        let direction: Direction = direction.parse().map_err(ApiError::Validation)?;
        query = query.direction(direction);
    }

    Ok(Json(state.pipeline.list(&query).await?))
}

/// GET /events/:id
pub async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Event>> {
    Ok(Json(state.pipeline.get(&id).await?))
}

/// DELETE /events/:id
pub async fn delete_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.pipeline.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /events/:id/retry
///
/// An empty body means defaults for every field. Anything else must be a
/// valid retry request.
pub async fn retry_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<RetryTicket>)> {
    let params = parse_retry_params(&body)?;
    let ticket = state.pipeline.retry_event(&id, params).await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

fn parse_retry_params(body: &[u8]) -> ApiResult<RetryParams> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RetryParams::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("Invalid retry request: {}", e)))
}

/// PUT /events/:id/status
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> ApiResult<Json<Event>> {
    let event = state
        .pipeline
        .update_event_status(&id, &req.status, req.error_message)
        .await?;
    Ok(Json(event))
}

/// GET /events/failed
pub async fn failed_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Json<EventsResponse>> {
    let limit = bounded_limit(params.limit, FAILED_DEFAULT_LIMIT, FAILED_MAX_LIMIT)?;
    let events = state.pipeline.get_failed_events(limit).await?;
    Ok(Json(events.into()))
}

/// POST /events/process
pub async fn process_pending(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Json<EventsResponse>> {
    let limit = bounded_limit(params.limit, PROCESS_DEFAULT_LIMIT, PROCESS_MAX_LIMIT)?;
    let events = state.pipeline.process_pending_events(limit).await?;
    Ok(Json(events.into()))
}

/// GET /events/retries
pub async fn list_retries(State(state): State<Arc<AppState>>) -> Json<Vec<ScheduledRetry>> {
    Json(state.pipeline.scheduled_retries())
}

/// DELETE /events/retries/:retry_id
pub async fn cancel_retry(
    State(state): State<Arc<AppState>>,
    Path(retry_id): Path<String>,
) -> ApiResult<Json<ScheduledRetry>> {
    Ok(Json(state.pipeline.cancel_retry(&retry_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_limit() {
        assert_eq!(bounded_limit(None, 50, 500).unwrap(), 50);
        assert_eq!(bounded_limit(Some(10), 50, 500).unwrap(), 10);
        assert_eq!(bounded_limit(Some(9999), 50, 500).unwrap(), 500);
        assert!(bounded_limit(Some(0), 50, 500).is_err());
    }

    #[test]
    fn test_parse_retry_params() {
        assert!(parse_retry_params(b"").unwrap().retry_options.is_none());
        assert!(parse_retry_params(b"  \n").unwrap().reason.is_none());

        let params = parse_retry_params(br#"{"retry_options":{"delay_seconds":5}}"#).unwrap();
        assert_eq!(params.retry_options.unwrap().delay_seconds, Some(5));

        for bad in [
            &b"not json"[..],
            br#"{"retry_options":{"delay_seconds":"five","max_attempts":-1}}"#,
            br#"{"priority":"sometime"}"#,
        ] {
            assert!(matches!(parse_retry_params(bad), Err(ApiError::Validation(_))));
        }
    }

    #[test]
    fn test_source_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(source_header(&headers), None);
        headers.insert(EVENT_SOURCE_HEADER, "mobile".parse().unwrap());
        assert_eq!(source_header(&headers), Some("mobile"));
    }
}
