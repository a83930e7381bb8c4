//! Per-recipient priority queues with acknowledgment, retry, and
//! dead-lettering, built on broker sorted sets.
//!
//! Each recipient queue `q` owns a pending sorted set (`q`), a processing
//! set (`q:processing`, scored by dequeue time for staleness detection), a
//! capped dead-letter set (`q:dead`), and per-message body/attempt keys.
//! Scores encode `(9 - priority, created_at)` so pop-minimum yields
//! highest priority, oldest first.
//!
//! Delivery is at-least-once: a dequeued message stays in the processing
//! set until acknowledged. The sweeper requeues entries abandoned past the
//! staleness threshold once, then dead-letters them on the second failure.

use crate::broker::BrokerPool;
use crate::error::Result;
use crate::protocol::{AgentMessage, MAX_PRIORITY};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Width of one priority band in the score space. Keeps the full score
/// inside f64's 53-bit integer range for Redis-style backends.
const PRIORITY_BAND: u64 = 10_000_000_000_000;

/// Sorted set indexing every queue name seen, for sweeping and
/// bus-wide depth accounting.
const QUEUE_INDEX: &str = "bus:queues";

/// Configuration for queue behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Poll interval for blocking dequeues
    pub poll_interval: Duration,
    /// Age past which a processing entry counts as abandoned
    pub stale_after: Duration,
    /// Times an abandoned message is requeued before dead-lettering
    pub max_requeues: u32,
    /// Maximum entries kept per dead-letter set
    pub dead_letter_cap: usize,
    /// Interval between sweeper runs
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stale_after: Duration::from_secs(30),
            max_requeues: 1,
            dead_letter_cap: 1000,
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Counts from one sweeper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Abandoned entries returned to pending
    pub requeued: usize,
    /// Entries moved to dead-letter sets
    pub dead_lettered: usize,
}

/// Priority queue layer over the broker.
pub struct ReliableQueue {
    pool: Arc<BrokerPool>,
    config: QueueConfig,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Encodes priority and creation time into one sortable score.
pub(crate) fn encode_score(priority: u8, created_at: DateTime<Utc>) -> u64 {
    let band = (MAX_PRIORITY - priority.min(MAX_PRIORITY)) as u64;
    band * PRIORITY_BAND + created_at.timestamp_millis().max(0) as u64
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

fn processing_key(queue: &str) -> String {
    format!("{}:processing", queue)
}

fn dead_key(queue: &str) -> String {
    format!("{}:dead", queue)
}

fn body_key(queue: &str, message_id: &str) -> String {
    format!("{}:msg:{}", queue, message_id)
}

fn attempts_key(queue: &str, message_id: &str) -> String {
    format!("{}:attempts:{}", queue, message_id)
}

impl ReliableQueue {
    pub fn new(pool: Arc<BrokerPool>, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            sweeper: std::sync::Mutex::new(None),
        }
    }

    /// Persists a message and inserts it into the recipient's pending set.
    pub async fn enqueue(&self, queue: &str, message: &AgentMessage) -> Result<String> {
        let body = serde_json::to_string(message)?;
        self.pool
            .set(&body_key(queue, &message.message_id), &body, None)
            .await?;
        let score = encode_score(message.priority, message.created_at);
        self.pool.zadd(queue, &message.message_id, score).await?;
        self.pool.zadd(QUEUE_INDEX, queue, 0).await?;
        debug!(queue, message_id = %message.message_id, priority = message.priority, "enqueued");
        Ok(message.message_id.clone())
    }

    /// Pops the highest-priority message, blocking up to `timeout`.
    ///
    /// The entry moves to the processing set until acknowledged or swept.
    pub async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<AgentMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_dequeue(queue).await? {
                return Ok(Some(message));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    /// Single non-blocking pop; used to drain backlogs.
    pub async fn try_dequeue(&self, queue: &str) -> Result<Option<AgentMessage>> {
        let processing = processing_key(queue);
        loop {
            let popped = self
                .pool
                .zpop_min_to(queue, &processing, now_millis())
                .await?;
            let (message_id, _) = match popped {
                Some(popped) => popped,
                None => return Ok(None),
            };
            match self.load_message(queue, &message_id).await? {
                Some(message) if message.is_expired() => {
                    self.transfer_dead(queue, &message_id, "ttl expired").await?;
                }
                Some(message) => return Ok(Some(message)),
                None => {
                    // Body gone (capped out of dead letters or cleaned up
                    // externally); drop the dangling entry.
                    self.pool.zrem(&processing, &message_id).await?;
                    self.pool
                        .delete(&attempts_key(queue, &message_id))
                        .await?;
                }
            }
        }
    }

    /// Completes delivery: the message leaves the processing set for good.
    /// Acknowledging an already-acknowledged message is a no-op.
    pub async fn acknowledge(&self, queue: &str, message_id: &str) -> Result<()> {
        let removed = self
            .pool
            .zrem(&processing_key(queue), message_id)
            .await?;
        self.pool.delete(&body_key(queue, message_id)).await?;
        self.pool.delete(&attempts_key(queue, message_id)).await?;
        if removed {
            debug!(queue, message_id, "acknowledged");
        }
        Ok(())
    }

    /// Returns a dequeued message to pending (priority decremented by one)
    /// or moves it straight to the dead-letter set.
    pub async fn reject(&self, queue: &str, message_id: &str, requeue: bool) -> Result<()> {
        if !requeue {
            self.transfer_dead(queue, message_id, "rejected").await?;
            return Ok(());
        }
        self.pool.zrem(&processing_key(queue), message_id).await?;
        match self.load_message(queue, message_id).await? {
            Some(message) => {
                let score =
                    encode_score(message.priority.saturating_sub(1), message.created_at);
                self.pool.zadd(queue, message_id, score).await?;
                debug!(queue, message_id, "rejected, requeued");
            }
            None => {
                self.pool.delete(&attempts_key(queue, message_id)).await?;
            }
        }
        Ok(())
    }

    /// Requeues processing entries older than `older_than` (once per
    /// message), dead-letters them on the second failure, and dead-letters
    /// pending messages whose TTL lapsed.
    pub async fn sweep_stale(&self, older_than: Duration) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let queues = self.pool.zrange_below(QUEUE_INDEX, u64::MAX).await?;
        for (queue, _) in queues {
            self.sweep_queue(&queue, older_than, &mut report).await?;
        }
        if report.requeued > 0 || report.dead_lettered > 0 {
            info!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                "sweep pass complete"
            );
        }
        Ok(report)
    }

    /// Number of messages waiting in one recipient's pending set.
    pub async fn pending_depth(&self, queue: &str) -> Result<usize> {
        self.pool.zcard(queue).await
    }

    /// Bus-wide pending count: the sum of every per-recipient depth.
    pub async fn total_pending(&self) -> Result<usize> {
        let queues = self.pool.zrange_below(QUEUE_INDEX, u64::MAX).await?;
        let mut total = 0;
        for (queue, _) in queues {
            total += self.pool.zcard(&queue).await?;
        }
        Ok(total)
    }

    /// Number of entries in one recipient's dead-letter set.
    pub async fn dead_letter_depth(&self, queue: &str) -> Result<usize> {
        self.pool.zcard(&dead_key(queue)).await
    }

    /// Dead-lettered messages for operator inspection, oldest first.
    pub async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<AgentMessage>> {
        let entries = self.pool.zrange_below(&dead_key(queue), u64::MAX).await?;
        let mut messages = Vec::new();
        for (message_id, _) in entries.into_iter().take(limit) {
            if let Some(message) = self.load_message(queue, &message_id).await? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Starts the periodic sweeper using the configured staleness
    /// threshold.
    pub fn spawn_sweeper(self: Arc<Self>) {
        let queue = Arc::clone(&self);
        let interval = self.config.sweep_interval;
        let stale_after = self.config.stale_after;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = queue.sweep_stale(stale_after).await {
                    warn!("sweep pass failed: {}", err);
                }
            }
        });
        *self.sweeper.lock().expect("sweeper lock poisoned") = Some(handle);
    }

    /// Stops the periodic sweeper.
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            handle.abort();
        }
    }

    async fn sweep_queue(
        &self,
        queue: &str,
        older_than: Duration,
        report: &mut SweepReport,
    ) -> Result<()> {
        // Abandoned deliveries: processing entries stamped before the cutoff.
        let processing = processing_key(queue);
        let cutoff = now_millis().saturating_sub(older_than.as_millis() as u64);
        for (message_id, _) in self.pool.zrange_below(&processing, cutoff).await? {
            let attempts = self.pool.incr(&attempts_key(queue, &message_id)).await?;
            if attempts > self.config.max_requeues as i64 {
                self.transfer_dead(queue, &message_id, "delivery retries exhausted")
                    .await?;
                report.dead_lettered += 1;
                continue;
            }
            match self.load_message(queue, &message_id).await? {
                Some(message) => {
                    self.pool.zrem(&processing, &message_id).await?;
                    let score = encode_score(message.priority, message.created_at);
                    self.pool.zadd(queue, &message_id, score).await?;
                    report.requeued += 1;
                    debug!(queue, message_id = %message_id, "requeued abandoned delivery");
                }
                None => {
                    self.pool.zrem(&processing, &message_id).await?;
                    self.pool
                        .delete(&attempts_key(queue, &message_id))
                        .await?;
                }
            }
        }

        // Expired pending messages.
        for (message_id, _) in self.pool.zrange_below(queue, u64::MAX).await? {
            match self.load_message(queue, &message_id).await? {
                Some(message) if message.is_expired() => {
                    self.transfer_dead(queue, &message_id, "ttl expired").await?;
                    report.dead_lettered += 1;
                }
                Some(_) => {}
                None => {
                    self.pool.zrem(queue, &message_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn load_message(&self, queue: &str, message_id: &str) -> Result<Option<AgentMessage>> {
        match self.pool.get(&body_key(queue, message_id)).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Moves a message out of pending/processing into the dead-letter set,
    /// trimming the set to its cap. The body is kept for inspection until
    /// the cap pushes it out.
    async fn transfer_dead(&self, queue: &str, message_id: &str, reason: &str) -> Result<()> {
        self.pool.zrem(queue, message_id).await?;
        self.pool.zrem(&processing_key(queue), message_id).await?;
        self.pool.delete(&attempts_key(queue, message_id)).await?;
        let dead = dead_key(queue);
        self.pool.zadd(&dead, message_id, now_millis()).await?;
        warn!(queue, message_id, reason, "message dead-lettered");

        while self.pool.zcard(&dead).await? > self.config.dead_letter_cap {
            match self.pool.zpop_min(&dead).await? {
                Some((evicted, _)) => {
                    self.pool.delete(&body_key(queue, &evicted)).await?;
                }
                None => break,
            }
        }
        Ok(())
    }
}
