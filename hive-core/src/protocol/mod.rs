//! Protocol types: messages, live-session frames, and the naming scheme
//! for topics and queues.
//!
//! Topics come in two families: per-agent inboxes (`agent:{id}`) and
//! workspace broadcast channels (`workspace:{id}`). They are not
//! pre-declared; a topic exists the moment a subscriber registers or a
//! publisher writes. Reliable-queue keys hang off the agent inbox name.

mod frames;
mod types;

pub use frames::{ChatPayload, ClientFrame, ConnectedData, ErrorData, ServerFrame};
pub use types::{AgentMessage, DeliveryMode, MessageType, DEFAULT_PRIORITY, MAX_PRIORITY};

/// Topic carrying direct messages for one agent.
pub fn agent_topic(agent_id: &str) -> String {
    format!("agent:{}", agent_id)
}

/// Shared broadcast channel for a workspace.
pub fn workspace_topic(workspace_id: &str) -> String {
    format!("workspace:{}", workspace_id)
}

/// Reliable-queue name backing an agent's inbox.
pub fn agent_inbox(agent_id: &str) -> String {
    format!("agent:{}:inbox", agent_id)
}
