//! WebSocket Handler
//!
//! Upgrades `/rt/ws` requests and hands the socket to the hub. The caller
//! identifies itself with the `X-User-Id` header.

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::StreamExt;
use std::sync::Arc;

use super::hub::ConnectionHub;
use crate::api::{ApiError, ApiResult, AppState};

/// Header carrying the caller's user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// WebSocket upgrade handler
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::Unauthorized("X-User-Id header is required".to_string()))?;

    let ws = ws.ok_or_else(|| ApiError::Validation("WebSocket upgrade required".to_string()))?;

    if state.hub.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }

    let hub = Arc::clone(&state.hub);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, user_id)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<ConnectionHub>, user_id: String) {
    let (sink, stream) = socket.split();

    // Rejections are reported to the client and logged by the hub
    let _ = hub.register(user_id, sink, stream).await;
}
