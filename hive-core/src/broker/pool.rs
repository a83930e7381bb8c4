//! Pooled access to the broker with retry, circuit breaking, and liveness
//! probing.
//!
//! The pool is the single choke point between the bus and the shared
//! store: bounded in-flight commands, transient failures retried with
//! capped exponential backoff and jitter, fatal failures surfaced
//! immediately, and a background probe that flips an `available` flag so
//! dependents can short-circuit instead of blocking on a dead link.

use super::{Broker, CircuitBreaker};
use crate::error::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for pool behavior.
#[derive(Debug, Clone)]
pub struct BrokerPoolConfig {
    /// Retries for a transient command failure
    pub max_retries: u32,
    /// First retry delay; doubles per attempt
    pub retry_base_delay: Duration,
    /// Ceiling for the backoff delay
    pub retry_max_delay: Duration,
    /// Maximum concurrent in-flight commands
    pub max_in_flight: usize,
    /// Interval between liveness probes
    pub probe_interval: Duration,
    /// Consecutive failures before the circuit opens
    pub breaker_threshold: u32,
    /// Time an open circuit waits before a trial command
    pub breaker_cooldown: Duration,
}

impl Default for BrokerPoolConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(2),
            max_in_flight: 32,
            probe_interval: Duration::from_secs(5),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(10),
        }
    }
}

/// Pooled broker handle shared by every bus component.
pub struct BrokerPool {
    broker: Arc<dyn Broker>,
    config: BrokerPoolConfig,
    permits: Arc<Semaphore>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    available: Arc<AtomicBool>,
    probe: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BrokerPool {
    /// Wraps a backend and starts the liveness probe.
    pub fn new(broker: Arc<dyn Broker>, config: BrokerPoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            broker,
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            breaker: Arc::new(Mutex::new(CircuitBreaker::new(
                config.breaker_threshold,
                config.breaker_cooldown,
            ))),
            available: Arc::new(AtomicBool::new(true)),
            probe: std::sync::Mutex::new(None),
            config,
        });
        pool.spawn_probe();
        pool
    }

    /// Direct handle to the backend, for long-lived subscriptions that
    /// manage their own retry loop.
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// Whether the last liveness probe succeeded.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Executes a command with retry on transient failures.
    ///
    /// Fatal errors are surfaced immediately and mark the pool
    /// unavailable until the probe sees the link recover.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Broker>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::connection("broker pool closed"))?;

        if !self.breaker.lock().await.allow_request() {
            return Err(Error::transient("broker circuit open"));
        }

        let mut attempt = 0u32;
        loop {
            match op(Arc::clone(&self.broker)).await {
                Ok(value) => {
                    self.breaker.lock().await.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    self.breaker.lock().await.record_failure();
                    let delay = self.backoff_delay(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying broker command: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.breaker.lock().await.record_failure();
                    if matches!(err, Error::FatalBroker(_)) {
                        self.available.store(false, Ordering::Relaxed);
                        error!("fatal broker error: {}", err);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Stops the probe and rejects further commands.
    pub fn close(&self) {
        self.permits.close();
        if let Some(handle) = self.probe.lock().expect("probe lock poisoned").take() {
            handle.abort();
        }
        info!("broker pool closed");
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .retry_base_delay
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let capped = exp.min(self.config.retry_max_delay);
        let jitter_ceiling = (capped.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
        capped + Duration::from_millis(jitter)
    }

    fn spawn_probe(&self) {
        let broker = Arc::clone(&self.broker);
        let available = Arc::clone(&self.available);
        let breaker = Arc::clone(&self.breaker);
        let interval = self.config.probe_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match broker.ping().await {
                    Ok(()) => {
                        if !available.swap(true, Ordering::Relaxed) {
                            info!("broker link restored");
                            breaker.lock().await.record_success();
                        }
                    }
                    Err(err) => {
                        if available.swap(false, Ordering::Relaxed) {
                            warn!("broker link down: {}", err);
                        }
                    }
                }
            }
        });
        *self.probe.lock().expect("probe lock poisoned") = Some(handle);
    }

    // -- convenience wrappers used by the layers above --

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.run(|b| async move { b.get(key).await }).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.run(|b| async move { b.set(key, value, ttl).await }).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.run(|b| async move { b.delete(key).await }).await
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        self.run(|b| async move { b.incr(key).await }).await
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.run(|b| async move { b.publish(channel, payload).await })
            .await
    }

    pub async fn zadd(&self, key: &str, member: &str, score: u64) -> Result<()> {
        self.run(|b| async move { b.zadd(key, member, score).await })
            .await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.run(|b| async move { b.zrem(key, member).await }).await
    }

    pub async fn zpop_min(&self, key: &str) -> Result<Option<(String, u64)>> {
        self.run(|b| async move { b.zpop_min(key).await }).await
    }

    pub async fn zpop_min_to(
        &self,
        src: &str,
        dst: &str,
        dst_score: u64,
    ) -> Result<Option<(String, u64)>> {
        self.run(|b| async move { b.zpop_min_to(src, dst, dst_score).await })
            .await
    }

    pub async fn zrange_below(&self, key: &str, max_score: u64) -> Result<Vec<(String, u64)>> {
        self.run(|b| async move { b.zrange_below(key, max_score).await })
            .await
    }

    pub async fn zcard(&self, key: &str) -> Result<usize> {
        self.run(|b| async move { b.zcard(key).await }).await
    }
}

impl Drop for BrokerPool {
    fn drop(&mut self) {
        if let Ok(mut probe) = self.probe.lock() {
            if let Some(handle) = probe.take() {
                handle.abort();
            }
        }
    }
}
