//! Per-session read and write pumps
//!
//! Each registered connection runs two tasks. The write pump is the only
//! writer to the socket; the read pump is the only reader. Either one ending
//! unregisters the session, and a panic in either is contained to its
//! session.

use axum::extract::ws::Message;
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::hub::{ConnectionHub, Frame, SessionId};
use super::messages::{ClientMessage, ServerMessage};

pub(crate) fn spawn_pumps<S, R, E>(
    hub: Arc<ConnectionHub>,
    id: SessionId,
    rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    sink: S,
    stream: R,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let write_hub = Arc::clone(&hub);
    let write_id = id.clone();
    let write_cancel = cancel.clone();
    tokio::spawn(async move {
        let pump = write_pump(&write_hub, &write_id, rx, write_cancel, sink);
        if AssertUnwindSafe(pump).catch_unwind().await.is_err() {
            tracing::error!(session_id = %write_id, "Write pump panicked");
        }
        write_hub.unregister(&write_id).await;
    });

    tokio::spawn(async move {
        let pump = read_pump(&hub, &id, cancel, stream);
        if AssertUnwindSafe(pump).catch_unwind().await.is_err() {
            tracing::error!(session_id = %id, "Read pump panicked");
        }
        hub.unregister(&id).await;
    });
}

/// Drain the outbound queue onto the socket, pinging on an interval
async fn write_pump<S>(
    hub: &ConnectionHub,
    id: &str,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    mut sink: S,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let period = hub.config().ping_interval;
    let mut ping = interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
                    tracing::debug!(session_id = %id, error = %e, "Write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    tracing::debug!(session_id = %id, error = %e, "Ping failed");
                    break;
                }
            }
            _ = cancel.cancelled() => {
                // Flush whatever was queued before the session was closed
                while let Ok(frame) = rx.try_recv() {
                    if sink.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    tracing::debug!(session_id = %id, "Write pump stopped");
}

/// Read client frames until close, error, idle timeout or cancellation
async fn read_pump<R, E>(hub: &ConnectionHub, id: &str, cancel: CancellationToken, mut stream: R)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let idle = hub.config().idle_timeout;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(idle, stream.next()) => next,
        };

        match next {
            Err(_) => {
                tracing::debug!(session_id = %id, "Session idle timeout");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(session_id = %id, error = %e, "Read failed");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => handle_client_frame(hub, id, &text).await,
            // Pongs and other frames only count as activity
            Ok(Some(Ok(_))) => {}
        }
    }

    tracing::debug!(session_id = %id, "Read pump stopped");
}

async fn handle_client_frame(hub: &ConnectionHub, id: &str, text: &str) {
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { topics }) => hub
            .subscribe(id, topics)
            .await
            .map(|topics| ServerMessage::Subscribed { topics }),
        Ok(ClientMessage::Unsubscribe { topics }) => hub
            .unsubscribe(id, topics)
            .await
            .map(|topics| ServerMessage::Unsubscribed { topics }),
        Err(e) => {
            tracing::debug!(session_id = %id, error = %e, "Unrecognized client frame ignored");
            return;
        }
    };

    match reply {
        Ok(message) => {
            if let Err(e) = hub.send_to(id, &message).await {
                tracing::debug!(session_id = %id, error = %e, "Reply not delivered");
            }
        }
        Err(e) => tracing::debug!(session_id = %id, error = %e, "Client frame ignored"),
    }
}
