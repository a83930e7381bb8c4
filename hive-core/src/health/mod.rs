//! Health monitoring and diagnostics for the bus.
//!
//! Runs a finite check sequence on a timer: connectivity ping, key/value
//! write/read round trip, pub/sub round trip on a private topic, and a
//! queue round trip on a private queue. Check latencies feed a rolling
//! window; connectivity or KV failures flip the status to unhealthy,
//! pub/sub or queue failures (or latency above the warning threshold)
//! degrade it. The monitor is read-only toward the rest of the bus.

use crate::broker::BrokerPool;
use crate::error::{Error, Result};
use crate::protocol::{AgentMessage, MessageType};
use crate::queue::ReliableQueue;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Health status of the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusHealth {
    /// All checks pass under the warning threshold
    Healthy,
    /// Latency above threshold or a non-critical check failed
    Degraded(String),
    /// Connectivity or write/read check failed
    Unhealthy(String),
}

impl BusHealth {
    pub fn label(&self) -> &'static str {
        match self {
            BusHealth::Healthy => "healthy",
            BusHealth::Degraded(_) => "degraded",
            BusHealth::Unhealthy(_) => "unhealthy",
        }
    }

    fn reason(&self) -> Option<String> {
        match self {
            BusHealth::Healthy => None,
            BusHealth::Degraded(reason) | BusHealth::Unhealthy(reason) => Some(reason.clone()),
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often to run the check sequence
    pub check_interval: Duration,
    /// Latency above which a passing round is still degraded
    pub warn_latency: Duration,
    /// Number of latency samples kept in the rolling window
    pub window: usize,
    /// Deadline for each individual check
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            warn_latency: Duration::from_millis(250),
            window: 32,
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Rolling latency statistics in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct LatencyStats {
    pub min_ms: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
    pub samples: usize,
}

/// Read-only snapshot served to monitoring collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub latency: LatencyStats,
}

/// Periodic prober of the broker, pub/sub, and queue paths.
pub struct HealthMonitor {
    pool: Arc<BrokerPool>,
    queue: Arc<ReliableQueue>,
    config: HealthConfig,
    /// Distinguishes this monitor's private probe topics and queue
    probe_id: String,
    status: Arc<RwLock<BusHealth>>,
    window: Arc<RwLock<VecDeque<Duration>>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<BrokerPool>, queue: Arc<ReliableQueue>, config: HealthConfig) -> Self {
        Self {
            pool,
            queue,
            config,
            probe_id: Uuid::new_v4().simple().to_string(),
            status: Arc::new(RwLock::new(BusHealth::Healthy)),
            window: Arc::new(RwLock::new(VecDeque::new())),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Runs the full check sequence once and updates the status.
    pub async fn run_checks(&self) -> BusHealth {
        let next = self.evaluate().await;
        let mut status = self.status.write().await;
        if *status != next {
            match &next {
                BusHealth::Healthy => info!("bus is healthy"),
                BusHealth::Degraded(reason) => warn!("bus degraded: {}", reason),
                BusHealth::Unhealthy(reason) => error!("bus unhealthy: {}", reason),
            }
        }
        *status = next.clone();
        next
    }

    /// Current status.
    pub async fn status(&self) -> BusHealth {
        self.status.read().await.clone()
    }

    /// Rolling latency statistics over the last N check samples.
    pub async fn latency(&self) -> LatencyStats {
        let window = self.window.read().await;
        if window.is_empty() {
            return LatencyStats {
                min_ms: 0,
                avg_ms: 0,
                max_ms: 0,
                samples: 0,
            };
        }
        let mut min = u64::MAX;
        let mut max = 0u64;
        let mut sum = 0u64;
        for sample in window.iter() {
            let ms = sample.as_millis() as u64;
            min = min.min(ms);
            max = max.max(ms);
            sum += ms;
        }
        LatencyStats {
            min_ms: min,
            avg_ms: sum / window.len() as u64,
            max_ms: max,
            samples: window.len(),
        }
    }

    /// Serializable status + latency snapshot.
    pub async fn report(&self) -> HealthReport {
        let status = self.status().await;
        HealthReport {
            status: status.label().to_string(),
            reason: status.reason(),
            latency: self.latency().await,
        }
    }

    /// Starts the periodic check loop.
    pub fn spawn(self: Arc<Self>) {
        let monitor = Arc::clone(&self);
        let interval = self.config.check_interval;
        let handle = tokio::spawn(async move {
            // First check after one full interval, not at startup.
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.run_checks().await;
            }
        });
        *self.task.lock().expect("health task lock poisoned") = Some(handle);
    }

    /// Stops the periodic check loop.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().expect("health task lock poisoned").take() {
            handle.abort();
        }
    }

    async fn evaluate(&self) -> BusHealth {
        if !self.pool.is_available() {
            return BusHealth::Unhealthy("broker link down".to_string());
        }

        let mut round_max = Duration::ZERO;
        let mut samples = Vec::with_capacity(4);
        match self.check_ping().await {
            Ok(latency) => {
                round_max = round_max.max(latency);
                samples.push(latency);
            }
            Err(err) => return BusHealth::Unhealthy(format!("connectivity check failed: {}", err)),
        }
        match self.check_kv().await {
            Ok(latency) => {
                round_max = round_max.max(latency);
                samples.push(latency);
            }
            Err(err) => return BusHealth::Unhealthy(format!("write/read check failed: {}", err)),
        }
        let mut degraded: Option<String> = None;
        match self.check_pubsub().await {
            Ok(latency) => {
                round_max = round_max.max(latency);
                samples.push(latency);
            }
            Err(err) => degraded = Some(format!("pub/sub check failed: {}", err)),
        }
        match self.check_queue().await {
            Ok(latency) => {
                round_max = round_max.max(latency);
                samples.push(latency);
            }
            Err(err) => {
                degraded.get_or_insert(format!("queue check failed: {}", err));
            }
        }
        self.record(samples).await;

        if let Some(reason) = degraded {
            return BusHealth::Degraded(reason);
        }
        if round_max > self.config.warn_latency {
            return BusHealth::Degraded(format!(
                "check latency {}ms above warning threshold",
                round_max.as_millis()
            ));
        }
        BusHealth::Healthy
    }

    async fn record(&self, samples: Vec<Duration>) {
        let mut window = self.window.write().await;
        for sample in samples {
            window.push_back(sample);
            while window.len() > self.config.window {
                window.pop_front();
            }
        }
    }

    async fn check_ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.deadline(self.pool.run(|b| async move { b.ping().await }))
            .await?;
        Ok(started.elapsed())
    }

    async fn check_kv(&self) -> Result<Duration> {
        let key = format!("health:{}:probe", self.probe_id);
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        self.deadline(self.pool.set(&key, &token, Some(Duration::from_secs(60))))
            .await?;
        let read = self.deadline(self.pool.get(&key)).await?;
        self.deadline(self.pool.delete(&key)).await?;
        if read.as_deref() != Some(token.as_str()) {
            return Err(Error::transient("write/read round trip returned stale value"));
        }
        Ok(started.elapsed())
    }

    async fn check_pubsub(&self) -> Result<Duration> {
        let topic = format!("health:{}:pubsub", self.probe_id);
        let token = Uuid::new_v4().to_string();
        let payload = json!({ "token": token }).to_string();

        let started = Instant::now();
        let mut stream = self.pool.broker().subscribe(&topic).await?;
        self.deadline(self.pool.publish(&topic, &payload)).await?;
        let received = timeout(self.config.probe_timeout, stream.next())
            .await
            .map_err(|_| Error::Timeout("pub/sub round trip deadline".to_string()))?;
        match received {
            Some(event) if event.payload == payload => Ok(started.elapsed()),
            Some(_) => Err(Error::transient("pub/sub round trip returned foreign event")),
            None => Err(Error::transient("pub/sub subscription closed mid-probe")),
        }
    }

    async fn check_queue(&self) -> Result<Duration> {
        let queue = format!("health:{}:inbox", self.probe_id);
        let probe = AgentMessage::new(
            "health-monitor",
            None,
            "health",
            MessageType::Notification,
            json!({ "probe": true }),
        )
        .with_ttl(60);

        let started = Instant::now();
        let id = self.deadline(self.queue.enqueue(&queue, &probe)).await?;
        let popped = self.deadline(self.queue.try_dequeue(&queue)).await?;
        self.deadline(self.queue.acknowledge(&queue, &id)).await?;
        match popped {
            Some(message) if message.message_id == id => Ok(started.elapsed()),
            _ => Err(Error::transient("queue round trip lost the probe message")),
        }
    }

    async fn deadline<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        timeout(self.config.probe_timeout, fut)
            .await
            .map_err(|_| Error::Timeout("health check deadline".to_string()))?
    }
}
