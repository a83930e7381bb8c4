//! Hive Collaboration Bus
//!
//! Core messaging layer for multi-agent workspaces: agents exchange
//! [`protocol::AgentMessage`]s through a central bus that stores and
//! routes them reliably, fans them out to live subscribers, and tracks
//! per-connection liveness.
//!
//! The [`bus::Bus`] object wires the layers together: the broker
//! connection pool, pub/sub fan-out, per-recipient priority queues with
//! acknowledgment and dead-lettering, the health monitor, the message
//! router, and the live WebSocket connection layer.

pub mod broker;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod protocol;
pub mod pubsub;
pub mod queue;
pub mod router;

// Re-export commonly used types
pub use bus::Bus;
pub use config::BusConfig;
pub use error::{Error, Result};
pub use protocol::{AgentMessage, DeliveryMode, MessageType};
pub use router::{StaticDirectory, WorkspaceDirectory};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: &str = "1.0.0";
