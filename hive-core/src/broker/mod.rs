//! Broker connection layer.
//!
//! Every external-store operation the bus performs goes through this one
//! seam: the [`Broker`] trait exposes the three primitive families the rest
//! of the system depends on (key/value, publish/subscribe channels, sorted
//! sets), and [`BrokerPool`] wraps a backend with bounded concurrency,
//! retry with capped exponential backoff, circuit breaking, and a periodic
//! liveness probe.
//!
//! [`MemoryBroker`] is the in-process backend used for single-node
//! deployments and tests; a Redis backend is available behind the
//! `redis-broker` feature for shared multi-process deployments.

mod circuit;
mod memory;
mod pool;
#[cfg(feature = "redis-broker")]
mod redis;

pub use circuit::{CircuitBreaker, CircuitState};
pub use memory::MemoryBroker;
pub use pool::{BrokerPool, BrokerPoolConfig};
#[cfg(feature = "redis-broker")]
pub use redis::RedisBroker;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// A single event received on a subscribed channel.
#[derive(Debug, Clone)]
pub struct BrokerEvent {
    /// Channel the event was published on
    pub channel: String,
    /// Raw payload as published
    pub payload: String,
}

/// Stream of events for one channel or pattern subscription.
///
/// Dropping the stream ends the subscription.
pub struct BrokerStream {
    rx: mpsc::UnboundedReceiver<BrokerEvent>,
}

impl BrokerStream {
    pub fn new(rx: mpsc::UnboundedReceiver<BrokerEvent>) -> Self {
        Self { rx }
    }

    /// Waits for the next event; `None` once the subscription is gone.
    pub async fn next(&mut self) -> Option<BrokerEvent> {
        self.rx.recv().await
    }
}

/// The shared-store primitives the bus is built on.
///
/// Sorted-set scores are `u64`; the queue layer keeps them inside f64's
/// 53-bit integer range so Redis-style backends can store them losslessly.
/// `zpop_min_to` must be atomic at the broker level: the pop and the
/// insertion into the destination set happen as one operation (spec'd for
/// the dequeue → processing handoff, where a lost update would drop a
/// message).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Reads a key; `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes a key, optionally with a time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Removes a key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically increments a counter key, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Publishes to a channel; returns how many subscriptions received it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Subscribes to one literal channel.
    async fn subscribe(&self, channel: &str) -> Result<BrokerStream>;

    /// Subscribes to a glob pattern (`*` wildcards).
    async fn psubscribe(&self, pattern: &str) -> Result<BrokerStream>;

    /// Adds a member with the given score, replacing any existing score.
    async fn zadd(&self, key: &str, member: &str, score: u64) -> Result<()>;

    /// Removes a member; returns whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Pops the minimum-score member.
    async fn zpop_min(&self, key: &str) -> Result<Option<(String, u64)>>;

    /// Atomically pops the minimum-score member of `src` and inserts it
    /// into `dst` with `dst_score`. Returns the popped member and its
    /// original score.
    async fn zpop_min_to(&self, src: &str, dst: &str, dst_score: u64)
        -> Result<Option<(String, u64)>>;

    /// Members with score at or below `max_score`, ascending.
    async fn zrange_below(&self, key: &str, max_score: u64) -> Result<Vec<(String, u64)>>;

    /// Number of members in the set.
    async fn zcard(&self, key: &str) -> Result<usize>;
}

/// Glob match for channel patterns; `*` matches any run of characters.
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    fn matches(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => matches(&p[1..], t) || (!t.is_empty() && matches(p, &t[1..])),
            Some(c) => t.first() == Some(c) && matches(&p[1..], &t[1..]),
        }
    }
    matches(pattern.as_bytes(), topic.as_bytes())
}
