//! WebSocket Connection Hub
//!
//! Owns the registry of live sessions and fans messages out to them.
//!
//! One `tokio::sync::Mutex` guards the registry; register, unregister and each
//! broadcast pass are a single critical section apiece, so a broadcast never
//! observes a half-registered session.
//!
//! Backpressure: every session has a bounded outbound queue
//! (`HubConfig::queue_capacity`). Producers use `try_send`; when a queue is
//! full the message is dropped for that session only and counted in
//! [`HubMetrics`]. A slow client never stalls a broadcast.

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::messages::ServerMessage;
use super::session;

/// Unique identifier for a session
pub type SessionId = String;

/// A serialized frame, shared by every queue it is enqueued on
pub type Frame = Arc<str>;

/// Maximum accepted length of a subscription topic
const MAX_TOPIC_LEN: usize = 128;

/// Configuration for the connection hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of concurrent sessions
    pub max_connections: usize,
    /// Capacity of each session's outbound queue
    pub queue_capacity: usize,
    /// Session is closed after this long without an inbound frame
    pub idle_timeout: Duration,
    /// How often the write pump pings the client
    pub ping_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            queue_capacity: 256,
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
        }
    }
}

/// Registry entry for one live session
struct SessionHandle {
    user_id: String,
    /// Producer side of the outbound queue; dropping it ends the write pump
    sender: mpsc::Sender<Frame>,
    subscriptions: HashSet<String>,
    /// Cancelled on unregister so the read pump stops waiting on the socket
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
}

/// Public view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub user_id: String,
    pub subscriptions: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

/// Outcome of one fan-out pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Sessions the frame was enqueued for
    pub delivered: usize,
    /// Sessions skipped because their queue was full or closed
    pub dropped: usize,
}

/// Manages all sessions and message fan-out
pub struct ConnectionHub {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    config: HubConfig,
    metrics: HubMetrics,
    shutdown: CancellationToken,
}

impl ConnectionHub {
    /// Create a new connection hub
    pub fn new(config: HubConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            metrics: HubMetrics::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a connection and start its read and write pumps
    ///
    /// Returns as soon as both pumps are spawned. A `connected` frame is the
    /// first thing queued for the client. When the hub is full or shutting
    /// down, an error frame is written and the connection closed.
    pub async fn register<S, R, E>(
        self: &Arc<Self>,
        user_id: impl Into<String>,
        mut sink: S,
        stream: R,
    ) -> Result<SessionId, HubError>
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let user_id = user_id.into();
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let cancel = self.shutdown.child_token();

        let admitted = {
            let mut sessions = self.sessions.lock().await;
            if self.shutdown.is_cancelled() {
                Err(HubError::ShuttingDown)
            } else if sessions.len() >= self.config.max_connections {
                Err(HubError::TooManyConnections(self.config.max_connections))
            } else {
                let hello = encode(&ServerMessage::Connected {
                    session_id: id.clone(),
                    user_id: user_id.clone(),
                });
                if let Some(frame) = hello {
                    // Fresh queue, cannot be full
                    let _ = tx.try_send(frame);
                }
                sessions.insert(
                    id.clone(),
                    SessionHandle {
                        user_id: user_id.clone(),
                        sender: tx,
                        subscriptions: HashSet::new(),
                        cancel: cancel.clone(),
                        connected_at: Utc::now(),
                    },
                );
                Ok(())
            }
        };

        if let Err(e) = admitted {
            tracing::warn!(user_id = %user_id, error = %e, "Rejected WebSocket session");
            if let Some(frame) = encode(&ServerMessage::Error {
                message: e.to_string(),
            }) {
                let _ = sink.send(Message::Text(frame.to_string())).await;
            }
            let _ = sink.close().await;
            return Err(e);
        }

        self.metrics.connection_opened();
        tracing::info!(session_id = %id, user_id = %user_id, "WebSocket connected");

        session::spawn_pumps(Arc::clone(self), id.clone(), rx, cancel, sink, stream);

        Ok(id)
    }

    /// Remove a session. Idempotent; returns whether it was registered.
    ///
    /// Dropping the queue sender lets the write pump drain and exit, and the
    /// cancelled token releases the read pump.
    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id);

        match removed {
            Some(handle) => {
                handle.cancel.cancel();
                self.metrics.connection_closed();
                tracing::info!(
                    session_id = %id,
                    user_id = %handle.user_id,
                    "WebSocket disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Fan a message out to every registered session
    ///
    /// Serializes once. Full queues drop the frame for that session; this is
    /// never reported as an error.
    pub async fn broadcast_to_all(&self, message: &ServerMessage) -> BroadcastReport {
        let Some(frame) = encode(message) else {
            return BroadcastReport::default();
        };

        let sessions = self.sessions.lock().await;
        let report = self.fan_out(sessions.iter(), &frame);

        tracing::trace!(
            delivered = report.delivered,
            dropped = report.dropped,
            "Broadcast to all sessions"
        );
        report
    }

    /// Fan a message out to sessions subscribed to `topic`
    ///
    /// A subscription matches when it equals the topic, is `*`, or is a
    /// `prefix.*` wildcard covering it.
    pub async fn broadcast_to_topic(&self, topic: &str, message: &ServerMessage) -> BroadcastReport {
        let Some(frame) = encode(message) else {
            return BroadcastReport::default();
        };

        let sessions = self.sessions.lock().await;
        let subscribed = sessions.iter().filter(|(_, handle)| {
            handle
                .subscriptions
                .iter()
                .any(|pattern| topic_matches(pattern, topic))
        });
        let report = self.fan_out(subscribed, &frame);

        if report.delivered > 0 || report.dropped > 0 {
            tracing::trace!(
                topic = %topic,
                delivered = report.delivered,
                dropped = report.dropped,
                "Broadcast to topic"
            );
        }
        report
    }

    fn fan_out<'a>(
        &self,
        targets: impl Iterator<Item = (&'a SessionId, &'a SessionHandle)>,
        frame: &Frame,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for (id, handle) in targets {
            match handle.sender.try_send(Arc::clone(frame)) {
                Ok(()) => {
                    report.delivered += 1;
                    self.metrics.message_sent();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    report.dropped += 1;
                    self.metrics.message_dropped();
                    tracing::debug!(session_id = %id, "Outbound queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Write pump already gone; its teardown will unregister
                    report.dropped += 1;
                    self.metrics.message_dropped();
                }
            }
        }

        report
    }

    /// Send a message to one session without blocking
    pub async fn send_to(&self, id: &str, message: &ServerMessage) -> Result<(), HubError> {
        let frame = encode(message).ok_or(HubError::Serialization)?;

        let sessions = self.sessions.lock().await;
        let handle = sessions.get(id).ok_or(HubError::SessionNotFound)?;

        handle.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.metrics.message_dropped();
                HubError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => HubError::SessionNotFound,
        })?;
        self.metrics.message_sent();
        Ok(())
    }

    /// Add topic filters to a session; invalid topics are skipped
    pub async fn subscribe(&self, id: &str, topics: Vec<String>) -> Result<Vec<String>, HubError> {
        let mut sessions = self.sessions.lock().await;
        let handle = sessions.get_mut(id).ok_or(HubError::SessionNotFound)?;

        let mut subscribed = Vec::new();
        for topic in topics {
            if !is_valid_topic(&topic) {
                tracing::warn!(session_id = %id, topic = %topic, "Invalid topic ignored");
                continue;
            }
            handle.subscriptions.insert(topic.clone());
            subscribed.push(topic);
        }

        tracing::debug!(session_id = %id, topics = ?subscribed, "Subscribed to topics");
        Ok(subscribed)
    }

    /// Remove topic filters from a session
    pub async fn unsubscribe(
        &self,
        id: &str,
        topics: Vec<String>,
    ) -> Result<Vec<String>, HubError> {
        let mut sessions = self.sessions.lock().await;
        let handle = sessions.get_mut(id).ok_or(HubError::SessionNotFound)?;

        let unsubscribed: Vec<String> = topics
            .into_iter()
            .filter(|topic| handle.subscriptions.remove(topic))
            .collect();

        tracing::debug!(session_id = %id, topics = ?unsubscribed, "Unsubscribed from topics");
        Ok(unsubscribed)
    }

    /// Get the current connection count
    pub async fn connection_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Snapshot of all live sessions
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, handle)| {
                let mut subscriptions: Vec<String> =
                    handle.subscriptions.iter().cloned().collect();
                subscriptions.sort();
                SessionInfo {
                    id: id.clone(),
                    user_id: handle.user_id.clone(),
                    subscriptions,
                    connected_at: handle.connected_at,
                }
            })
            .collect();
        infos.sort_by_key(|info| info.connected_at);
        infos
    }

    pub fn metrics(&self) -> HubMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Close every session and refuse new ones
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let drained: Vec<(SessionId, SessionHandle)> =
            self.sessions.lock().await.drain().collect();

        for (_, handle) in &drained {
            handle.cancel.cancel();
            self.metrics.connection_closed();
        }

        tracing::info!(sessions = drained.len(), "Connection hub shut down");
    }
}

fn encode(message: &ServerMessage) -> Option<Frame> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Frame::from(text)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server message");
            None
        }
    }
}

fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && !topic.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Whether subscription `pattern` covers `topic`
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" || pattern == topic {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('.') => topic.starts_with(prefix),
        _ => false,
    }
}

/// Hub-level counters
#[derive(Debug, Default)]
pub struct HubMetrics {
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl HubMetrics {
    fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HubMetricsSnapshot {
        HubMetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Serializable hub metrics
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HubMetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

/// Errors that can occur in the connection hub
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("Session not found")]
    SessionNotFound,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Failed to serialize message")]
    Serialization,

    #[error("Hub is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::Event;
    use futures_util::StreamExt;

    /// In-memory connection: returns (sink, stream, client inbox, client outbox)
    pub(crate) fn fake_connection() -> (
        impl Sink<Message, Error = String> + Unpin + Send + 'static,
        impl Stream<Item = Result<Message, String>> + Unpin + Send + 'static,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedSender<Result<Message, String>>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<Message, String>>();

        let sink = Box::pin(futures_util::sink::unfold(
            out_tx,
            |tx, msg: Message| async move {
                tx.send(msg).map_err(|e| e.to_string())?;
                Ok::<_, String>(tx)
            },
        ));
        let stream = Box::pin(futures_util::stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }));

        (sink, stream, out_rx, in_tx)
    }

    fn text_of(msg: Message) -> serde_json::Value {
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    async fn next_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed");
            if matches!(msg, Message::Text(_)) {
                return text_of(msg);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("events.*", "events.user_action"));
        assert!(topic_matches("events.user_action", "events.user_action"));
        assert!(topic_matches("*", "anything"));
        assert!(!topic_matches("events.*", "system"));
        assert!(!topic_matches("events.signup", "events.user_action"));
        assert!(!topic_matches("ev*", "events.x"));
    }

    #[test]
    fn test_valid_topics() {
        assert!(is_valid_topic("events.user_action"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("has space"));
        assert!(!is_valid_topic(&"x".repeat(MAX_TOPIC_LEN + 1)));
    }

    #[tokio::test]
    async fn test_register_sends_connected_then_unregister() {
        let hub = Arc::new(ConnectionHub::new(HubConfig::default()));
        let (sink, stream, mut out, _inbox) = fake_connection();

        let id = hub.register("user-1", sink, stream).await.unwrap();
        assert_eq!(hub.connection_count().await, 1);

        let hello = next_text(&mut out).await;
        assert_eq!(hello["type"], "connected");
        assert_eq!(hello["data"]["session_id"], id.as_str());
        assert_eq!(hello["data"]["user_id"], "user-1");

        assert!(hub.unregister(&id).await);
        assert!(!hub.unregister(&id).await);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = HubConfig {
            max_connections: 1,
            ..Default::default()
        };
        let hub = Arc::new(ConnectionHub::new(config));

        let (s1, r1, _o1, _i1) = fake_connection();
        let (s2, r2, mut o2, _i2) = fake_connection();

        hub.register("a", s1, r1).await.unwrap();
        let result = hub.register("b", s2, r2).await;
        assert!(matches!(result, Err(HubError::TooManyConnections(1))));

        let rejection = next_text(&mut o2).await;
        assert_eq!(rejection["type"], "error");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_registered_not_unregistered() {
        let hub = Arc::new(ConnectionHub::new(HubConfig::default()));
        let (s1, r1, mut o1, _i1) = fake_connection();
        let (s2, r2, mut o2, _i2) = fake_connection();

        let id1 = hub.register("a", s1, r1).await.unwrap();
        let id2 = hub.register("b", s2, r2).await.unwrap();
        next_text(&mut o1).await;
        next_text(&mut o2).await;

        hub.unregister(&id2).await;

        let event = Event::new("user_action", "web_app");
        let report = hub.broadcast_to_all(&ServerMessage::Event(event.clone())).await;
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 0 });

        let received = next_text(&mut o1).await;
        assert_eq!(received["type"], "event");
        assert_eq!(received["data"]["id"], event.id.as_str());

        // Unregistered session only ever sees the close of its connection
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(200), o2.recv()).await
        {
            assert!(!matches!(msg, Message::Text(_)), "unexpected frame after unregister");
        }

        hub.unregister(&id1).await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let config = HubConfig {
            queue_capacity: 2,
            ..Default::default()
        };
        let hub = ConnectionHub::new(config);

        // Registered by hand with no write pump draining the queue
        let (tx, _rx) = mpsc::channel(2);
        hub.sessions.lock().await.insert(
            "slow".to_string(),
            SessionHandle {
                user_id: "u".to_string(),
                sender: tx,
                subscriptions: HashSet::new(),
                cancel: CancellationToken::new(),
                connected_at: Utc::now(),
            },
        );

        let msg = ServerMessage::Error {
            message: "tick".to_string(),
        };
        for _ in 0..2 {
            assert_eq!(hub.broadcast_to_all(&msg).await.delivered, 1);
        }
        let report = hub.broadcast_to_all(&msg).await;
        assert_eq!(report, BroadcastReport { delivered: 0, dropped: 1 });
        assert_eq!(hub.metrics().messages_dropped, 1);
        assert!(matches!(hub.send_to("slow", &msg).await, Err(HubError::QueueFull)));
    }

    #[tokio::test]
    async fn test_subscribe_via_frames_and_topic_broadcast() {
        let hub = Arc::new(ConnectionHub::new(HubConfig::default()));
        let (s1, r1, mut o1, i1) = fake_connection();
        let (s2, r2, mut o2, _i2) = fake_connection();

        let id1 = hub.register("a", s1, r1).await.unwrap();
        hub.register("b", s2, r2).await.unwrap();
        next_text(&mut o1).await;
        next_text(&mut o2).await;

        i1.send(Ok(Message::Text(
            r#"{"type":"subscribe","topics":["events.*",""]}"#.to_string(),
        )))
        .unwrap();
        let ack = next_text(&mut o1).await;
        assert_eq!(ack["type"], "subscribed");
        assert_eq!(ack["data"]["topics"], serde_json::json!(["events.*"]));

        let sessions = hub.sessions().await;
        let first = sessions.iter().find(|s| s.id == id1).unwrap();
        assert_eq!(first.subscriptions, vec!["events.*".to_string()]);

        let event = Event::new("user_action", "web");
        let report = hub
            .broadcast_to_topic(
                &ServerMessage::event_topic(&event),
                &ServerMessage::EventStatus(event),
            )
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(next_text(&mut o1).await["type"], "event_status");

        i1.send(Ok(Message::Text(
            r#"{"type":"unsubscribe","topics":["events.*"]}"#.to_string(),
        )))
        .unwrap();
        assert_eq!(next_text(&mut o1).await["type"], "unsubscribed");
    }

    #[tokio::test]
    async fn test_peer_close_unregisters() {
        let hub = Arc::new(ConnectionHub::new(HubConfig::default()));
        let (sink, stream, _out, inbox) = fake_connection();

        hub.register("a", sink, stream).await.unwrap();
        inbox.send(Ok(Message::Close(None))).unwrap();

        for _ in 0..50 {
            if hub.connection_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_read_error_unregisters() {
        let hub = Arc::new(ConnectionHub::new(HubConfig::default()));
        let (sink, stream, _out, inbox) = fake_connection();

        hub.register("a", sink, stream).await.unwrap();
        inbox.send(Err("connection reset".to_string())).unwrap();

        for _ in 0..50 {
            if hub.connection_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_unregisters() {
        let config = HubConfig {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let hub = Arc::new(ConnectionHub::new(config));
        let (sink, stream, _out, _inbox) = fake_connection();

        hub.register("a", sink, stream).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_rejects_new() {
        let hub = Arc::new(ConnectionHub::new(HubConfig::default()));
        let (s1, r1, mut o1, _i1) = fake_connection();
        hub.register("a", s1, r1).await.unwrap();
        next_text(&mut o1).await;

        hub.shutdown().await;
        assert_eq!(hub.connection_count().await, 0);
        assert!(hub.is_shutting_down());

        let closed = loop {
            match tokio::time::timeout(Duration::from_secs(2), o1.recv()).await {
                Ok(Some(Message::Close(_))) => break true,
                Ok(Some(_)) => continue,
                _ => break false,
            }
        };
        assert!(closed);

        let (s2, r2, _o2, _i2) = fake_connection();
        assert!(matches!(
            hub.register("b", s2, r2).await,
            Err(HubError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_connection_stream_helper_ends() {
        let (_sink, mut stream, _out, inbox) = fake_connection();
        drop(inbox);
        assert!(stream.next().await.is_none());
    }
}
