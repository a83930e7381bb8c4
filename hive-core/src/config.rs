//! Top-level bus configuration.
//!
//! Loadable from TOML with every field defaulted, then converted into the
//! per-component config structs. The optional `[workspaces]` table seeds a
//! static membership roster for standalone deployments.

use crate::broker::BrokerPoolConfig;
use crate::connection::SessionConfig;
use crate::error::{Error, Result};
use crate::health::HealthConfig;
use crate::queue::QueueConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Bus-wide configuration, one section per component.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub broker: BrokerSection,
    pub queue: QueueSection,
    pub session: SessionSection,
    pub health: HealthSection,
    /// Static workspace roster: workspace id → member agent ids
    pub workspaces: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    /// Backend address; `memory://` selects the in-process broker
    pub url: String,
    pub max_in_flight: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub probe_interval_secs: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        let defaults = BrokerPoolConfig::default();
        Self {
            url: "memory://".to_string(),
            max_in_flight: defaults.max_in_flight,
            max_retries: defaults.max_retries,
            retry_base_delay_ms: defaults.retry_base_delay.as_millis() as u64,
            retry_max_delay_ms: defaults.retry_max_delay.as_millis() as u64,
            probe_interval_secs: defaults.probe_interval.as_secs(),
            breaker_threshold: defaults.breaker_threshold,
            breaker_cooldown_secs: defaults.breaker_cooldown.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub poll_interval_ms: u64,
    pub stale_after_secs: u64,
    pub max_requeues: u32,
    pub dead_letter_cap: usize,
    pub sweep_interval_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        let defaults = QueueConfig::default();
        Self {
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            stale_after_secs: defaults.stale_after.as_secs(),
            max_requeues: defaults.max_requeues,
            dead_letter_cap: defaults.dead_letter_cap,
            sweep_interval_secs: defaults.sweep_interval.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub buffer_size: usize,
    pub backlog_limit: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            heartbeat_interval_secs: defaults.heartbeat_interval.as_secs(),
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            buffer_size: defaults.buffer_size,
            backlog_limit: defaults.backlog_limit,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub check_interval_secs: u64,
    pub warn_latency_ms: u64,
    pub window: usize,
    pub probe_timeout_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        let defaults = HealthConfig::default();
        Self {
            check_interval_secs: defaults.check_interval.as_secs(),
            warn_latency_ms: defaults.warn_latency.as_millis() as u64,
            window: defaults.window,
            probe_timeout_secs: defaults.probe_timeout.as_secs(),
        }
    }
}

impl BusConfig {
    /// Reads a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&text).map_err(|err| Error::Config(err.to_string()))
    }

    pub fn broker_pool(&self) -> BrokerPoolConfig {
        BrokerPoolConfig {
            max_retries: self.broker.max_retries,
            retry_base_delay: Duration::from_millis(self.broker.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.broker.retry_max_delay_ms),
            max_in_flight: self.broker.max_in_flight,
            probe_interval: Duration::from_secs(self.broker.probe_interval_secs),
            breaker_threshold: self.broker.breaker_threshold,
            breaker_cooldown: Duration::from_secs(self.broker.breaker_cooldown_secs),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
            stale_after: Duration::from_secs(self.queue.stale_after_secs),
            max_requeues: self.queue.max_requeues,
            dead_letter_cap: self.queue.dead_letter_cap,
            sweep_interval: Duration::from_secs(self.queue.sweep_interval_secs),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(self.session.heartbeat_interval_secs),
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            buffer_size: self.session.buffer_size,
            backlog_limit: self.session.backlog_limit,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            check_interval: Duration::from_secs(self.health.check_interval_secs),
            warn_latency: Duration::from_millis(self.health.warn_latency_ms),
            window: self.health.window,
            probe_timeout: Duration::from_secs(self.health.probe_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_component_configs() {
        let config = BusConfig::default();
        assert_eq!(config.broker.url, "memory://");
        assert_eq!(
            config.queue_config().stale_after,
            QueueConfig::default().stale_after
        );
        assert_eq!(
            config.session_config().idle_timeout,
            SessionConfig::default().idle_timeout
        );
        assert_eq!(
            config.health_config().warn_latency,
            HealthConfig::default().warn_latency
        );
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: BusConfig = toml::from_str(
            r#"
            [broker]
            url = "redis://127.0.0.1:6379"
            max_retries = 5

            [session]
            idle_timeout_secs = 15

            [workspaces]
            ws-1 = ["agent-a", "agent-b"]
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.url, "redis://127.0.0.1:6379");
        assert_eq!(config.broker.max_retries, 5);
        // Unspecified fields keep their defaults.
        assert_eq!(
            config.broker.max_in_flight,
            BrokerPoolConfig::default().max_in_flight
        );
        assert_eq!(
            config.session_config().idle_timeout,
            Duration::from_secs(15)
        );
        assert_eq!(
            config.workspaces.get("ws-1").unwrap(),
            &vec!["agent-a".to_string(), "agent-b".to_string()]
        );
    }
}
