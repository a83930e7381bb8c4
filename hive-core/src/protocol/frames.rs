//! Tagged envelopes for the live-session protocol.
//!
//! Multiple logical message classes multiplex over one WebSocket session as
//! small `{type, ...}` envelopes. Client frames arrive as `chat`, `ping`, or
//! `subscribe`; server frames push `connected`, `message`, `notification`,
//! `reasoning_step`, `error`, and `pong`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{AgentMessage, MessageType};

/// Payload of a client `chat` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Recipient agent; `None` requests a workspace broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<String>,
    /// Opaque message content
    pub content: Value,
    /// Kind of message, defaults to `request`
    #[serde(default)]
    pub message_type: Option<MessageType>,
    /// 0–9 priority, defaults to 5
    #[serde(default)]
    pub priority: Option<u8>,
    /// Seconds until an undelivered message is discarded
    #[serde(default)]
    pub ttl: Option<u64>,
}

/// Frames a client may send over a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Send a message through the router
    Chat { payload: ChatPayload },
    /// Liveness probe; answered with `pong`
    Ping,
    /// Subscribe the session to additional channels
    Subscribe { channels: Vec<String> },
}

/// Session identifier handed back on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedData {
    pub session_id: String,
}

/// Error detail pushed before a protocol-level close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

/// Frames the server pushes to a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Session established; carries the session id
    Connected { data: ConnectedData },
    /// A routed agent message
    Message { data: Value },
    /// A best-effort notification (broadcasts land here)
    Notification { data: Value },
    /// An intermediate reasoning step streamed by an agent
    ReasoningStep { data: Value },
    /// Protocol or delivery error on this session
    Error { data: ErrorData },
    /// Answer to a client `ping`
    Pong,
}

impl ServerFrame {
    /// Wraps a routed message in the envelope its type calls for.
    ///
    /// Agents streaming intermediate output tag their content with
    /// `"kind": "reasoning_step"`; those land in the dedicated envelope so
    /// clients can render them apart from final messages.
    pub fn from_message(message: &AgentMessage) -> Self {
        let data = serde_json::to_value(message).unwrap_or(Value::Null);
        if message.content.get("kind").and_then(Value::as_str) == Some("reasoning_step") {
            return ServerFrame::ReasoningStep { data };
        }
        match message.message_type {
            MessageType::Notification => ServerFrame::Notification { data },
            _ => ServerFrame::Message { data },
        }
    }

    /// Builds an `error` frame from any displayable reason.
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            data: ErrorData {
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_tags() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","channels":["workspace:w1"]}"#).unwrap();
        match frame {
            ClientFrame::Subscribe { channels } => assert_eq!(channels, vec!["workspace:w1"]),
            other => panic!("unexpected frame: {:?}", other),
        }

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"chat","payload":{"to_agent":"b","content":{"x":1}}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Chat { payload } => {
                assert_eq!(payload.to_agent.as_deref(), Some("b"));
                assert_eq!(payload.content, json!({"x": 1}));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_server_frame_tags() {
        let frame = ServerFrame::Connected {
            data: ConnectedData {
                session_id: "s1".to_string(),
            },
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains(r#""type":"connected""#));
        assert!(text.contains(r#""session_id":"s1""#));

        let text = serde_json::to_string(&ServerFrame::Pong).unwrap();
        assert_eq!(text, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_frame_from_message() {
        let msg = AgentMessage::new(
            "a",
            Some("b".to_string()),
            "ws",
            MessageType::Notification,
            json!({"text": "hi"}),
        );
        assert!(matches!(
            ServerFrame::from_message(&msg),
            ServerFrame::Notification { .. }
        ));

        let msg = AgentMessage::new(
            "a",
            Some("b".to_string()),
            "ws",
            MessageType::Response,
            json!({"kind": "reasoning_step", "step": 1}),
        );
        assert!(matches!(
            ServerFrame::from_message(&msg),
            ServerFrame::ReasoningStep { .. }
        ));

        let msg = AgentMessage::new(
            "a",
            Some("b".to_string()),
            "ws",
            MessageType::Request,
            json!({"ask": "status"}),
        );
        assert!(matches!(
            ServerFrame::from_message(&msg),
            ServerFrame::Message { .. }
        ));
    }
}
