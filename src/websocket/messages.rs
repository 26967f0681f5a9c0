//! WebSocket Message Types
//!
//! Every server frame is an envelope `{"type": ..., "data": ...}`. Client
//! frames are flat objects discriminated by `type`.

use serde::{Deserialize, Serialize};

use crate::store::Event;

/// Messages sent from client to server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Add topic filters (e.g. "events.user_action", "events.*")
    Subscribe { topics: Vec<String> },
    /// Remove topic filters
    Unsubscribe { topics: Vec<String> },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session established
    Connected { session_id: String, user_id: String },
    /// A new event was published
    Event(Event),
    /// An event reached a new processing status (topic-scoped)
    EventStatus(Event),
    /// Subscription confirmed
    Subscribed { topics: Vec<String> },
    /// Unsubscription confirmed
    Unsubscribed { topics: Vec<String> },
    /// Error message
    Error { message: String },
}

impl ServerMessage {
    /// Topic under which status changes of `event` are published
    pub fn event_topic(event: &Event) -> String {
        format!("events.{}", event.event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_deserialize_subscribe() {
        let json = r#"{"type": "subscribe", "topics": ["events.user_action", "events.*"]}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Subscribe { topics } => {
                assert_eq!(topics.len(), 2);
                assert_eq!(topics[0], "events.user_action");
            }
            _ => panic!("Expected Subscribe"),
        }
    }

    #[test]
    fn test_client_message_rejects_unknown_type() {
        let json = r#"{"type": "echo", "text": "hi"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn test_event_envelope() {
        let event = Event::new("user_action", "web_app");
        let json = serde_json::to_value(ServerMessage::Event(event.clone())).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["data"]["id"], event.id.as_str());
        assert_eq!(json["data"]["type"], "user_action");
        assert_eq!(json["data"]["status"], "pending");
    }

    #[test]
    fn test_connected_envelope() {
        let msg = ServerMessage::Connected {
            session_id: "abc-123".to_string(),
            user_id: "u1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"connected\""));
        assert!(json.contains("\"session_id\":\"abc-123\""));
    }

    #[test]
    fn test_event_topic() {
        let event = Event::new("order_placed", "web");
        assert_eq!(ServerMessage::event_topic(&event), "events.order_placed");
    }
}
