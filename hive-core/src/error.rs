//! Error handling for the collaboration bus.
//!
//! This module provides a centralized error type and result alias for all
//! bus operations. The broker variants split along the retry boundary:
//! [`Error::TransientBroker`] is retried by the broker pool with backoff,
//! [`Error::FatalBroker`] surfaces immediately.
//!
//! # Examples
//!
//! ```rust
//! use hive_core::error::{Error, Result};
//!
//! fn validate_priority(priority: u8) -> Result<()> {
//!     if priority > 9 {
//!         return Err(Error::protocol("priority must be between 0 and 9"));
//!     }
//!     Ok(())
//! }
//! ```

use std::io;
use thiserror::Error;

/// Comprehensive error type for bus operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Retryable broker failures (connection blip, timeout)
    #[error("Transient broker error: {0}")]
    TransientBroker(String),

    /// Non-retryable broker failures (auth/config) — surfaced immediately
    #[error("Fatal broker error: {0}")]
    FatalBroker(String),

    /// A message exceeded its retry/TTL budget and was dead-lettered
    #[error("Delivery failure: {0}")]
    Delivery(String),

    /// Malformed client frame or invalid message shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Live-session connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Reliable-queue operation failures
    #[error("Queue error: {0}")]
    Queue(String),

    /// An operation did not complete within its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O operation failures
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience type alias for Results with bus errors.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new transient broker error with the given message.
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::TransientBroker(msg.into())
    }

    /// Creates a new fatal broker error with the given message.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::FatalBroker(msg.into())
    }

    /// Creates a new protocol error with the given message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    /// Creates a new queue error with the given message.
    pub fn queue(msg: impl Into<String>) -> Self {
        Error::Queue(msg.into())
    }

    /// Whether the broker pool should retry the failed command.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientBroker(_) | Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::transient("connection reset");
        assert!(matches!(err, Error::TransientBroker(_)));

        let err = Error::fatal("bad credentials");
        assert!(matches!(err, Error::FatalBroker(_)));

        let err = Error::protocol("unknown frame tag");
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_error_display() {
        let err = Error::transient("connection reset");
        assert_eq!(err.to_string(), "Transient broker error: connection reset");

        let err = Error::queue("unknown queue");
        assert_eq!(err.to_string(), "Queue error: unknown queue");
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::transient("blip").is_transient());
        assert!(Error::Timeout("probe".into()).is_transient());
        assert!(!Error::fatal("auth").is_transient());
        assert!(!Error::protocol("bad frame").is_transient());
    }
}
