//! Core message types exchanged over the bus.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default priority assigned when the sender does not specify one.
pub const DEFAULT_PRIORITY: u8 = 5;
/// Highest priority — delivered first.
pub const MAX_PRIORITY: u8 = 9;

/// Represents the different kinds of messages routed by the bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Request messages expect a response
    Request,
    /// Response messages are sent in reply to requests
    Response,
    /// Notification messages are one-way, best-effort signals
    Notification,
    /// Command messages instruct an agent to act
    Command,
}

/// Delivery policy for a direct send.
///
/// `Both` is the default: the message is enqueued for reliable pickup *and*
/// published for anyone currently live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Enqueue and publish (at-least-once plus realtime push)
    #[default]
    Both,
    /// Publish only — lost if no subscriber is live
    PubSubOnly,
    /// Enqueue only — no realtime push
    QueueOnly,
}

/// The unit of communication between agents.
///
/// Immutable after creation; the bus stores and forwards the `content`
/// document without inspecting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Globally unique identifier, generated at creation
    pub message_id: String,
    /// Sender agent ID
    pub from_agent: String,
    /// Recipient agent ID; `None` (or "*") denotes broadcast
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<String>,
    /// Scoping namespace; messages never cross workspaces implicitly
    pub workspace_id: String,
    /// Kind of message
    pub message_type: MessageType,
    /// Opaque structured payload, unexamined by the bus
    pub content: Value,
    /// 0–9, 9 delivered first
    pub priority: u8,
    /// Advisory flag; not enforced by the bus
    pub requires_response: bool,
    /// Seconds after which an undelivered message is discarded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Links a response back to its request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Set at creation; tiebreak in priority ordering (older first)
    pub created_at: DateTime<Utc>,
}

impl AgentMessage {
    /// Creates a new message with a fresh id and the default priority.
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: Option<String>,
        workspace_id: impl Into<String>,
        message_type: MessageType,
        content: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            from_agent: from_agent.into(),
            to_agent,
            workspace_id: workspace_id.into(),
            message_type,
            content,
            priority: DEFAULT_PRIORITY,
            requires_response: false,
            ttl: None,
            correlation_id: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the priority, clamped to the 0–9 range.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    /// Sets the time-to-live in seconds.
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl = Some(ttl_secs);
        self
    }

    /// Adds a correlation ID linking this message to a request.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Marks the message as expecting a response.
    pub fn with_requires_response(mut self, requires_response: bool) -> Self {
        self.requires_response = requires_response;
        self
    }

    /// Whether the message is addressed to everyone rather than one agent.
    pub fn is_broadcast(&self) -> bool {
        match self.to_agent.as_deref() {
            None | Some("*") => true,
            Some(_) => false,
        }
    }

    /// Whether the TTL has lapsed since creation.
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(secs) => {
                let deadline = self.created_at + ChronoDuration::seconds(secs as i64);
                Utc::now() > deadline
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = AgentMessage::new(
            "agent-a",
            Some("agent-b".to_string()),
            "ws-1",
            MessageType::Request,
            json!({"ask": "status"}),
        );

        assert_eq!(msg.from_agent, "agent-a");
        assert_eq!(msg.to_agent.as_deref(), Some("agent-b"));
        assert_eq!(msg.priority, DEFAULT_PRIORITY);
        assert!(!msg.message_id.is_empty());
        assert!(!msg.is_broadcast());
        assert!(!msg.is_expired());
    }

    #[test]
    fn test_priority_clamped() {
        let msg = AgentMessage::new("a", None, "ws", MessageType::Command, json!({}))
            .with_priority(42);
        assert_eq!(msg.priority, MAX_PRIORITY);
    }

    #[test]
    fn test_broadcast_addressing() {
        let msg = AgentMessage::new("a", None, "ws", MessageType::Notification, json!({}));
        assert!(msg.is_broadcast());

        let msg = AgentMessage::new(
            "a",
            Some("*".to_string()),
            "ws",
            MessageType::Notification,
            json!({}),
        );
        assert!(msg.is_broadcast());
    }

    #[test]
    fn test_expiry() {
        let mut msg = AgentMessage::new("a", None, "ws", MessageType::Notification, json!({}))
            .with_ttl(60);
        assert!(!msg.is_expired());

        msg.created_at = Utc::now() - ChronoDuration::seconds(120);
        assert!(msg.is_expired());
    }

    #[test]
    fn test_message_type_wire_format() {
        let tag = serde_json::to_string(&MessageType::Notification).unwrap();
        assert_eq!(tag, "\"notification\"");
    }
}
