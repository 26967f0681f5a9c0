//! WebSocket Real-Time Delivery
//!
//! Pushes events to connected clients as they are published and processed.
//!
//! ## Architecture
//!
//! - **ConnectionHub**: Registry of live sessions, fan-out, backpressure
//! - **Session pumps**: One read task and one write task per connection
//! - **Handler**: WebSocket upgrade and caller identification
//! - **Messages**: Client and server frame formats
//!
//! ## Topics
//!
//! Every session receives `event` frames for newly published events.
//! Processing outcomes are sent as `event_status` frames on
//! `events.{type}`; subscribe with `events.*` to receive all of them.
//!
//! ## Example
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:8090/rt/ws');
//!
//! ws.onopen = () => {
//!   ws.send(JSON.stringify({type: 'subscribe', topics: ['events.user_action']}));
//! };
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   console.log(msg.type, msg.data);
//! };
//! ```

mod handler;
mod hub;
mod messages;
mod session;

pub use handler::{websocket_handler, USER_ID_HEADER};
pub use hub::{
    topic_matches, BroadcastReport, ConnectionHub, HubConfig, HubError, HubMetricsSnapshot,
    SessionId, SessionInfo,
};
pub use messages::{ClientMessage, ServerMessage};

#[cfg(test)]
pub(crate) use hub::tests::fake_connection;
