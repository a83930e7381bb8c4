//! Topic-based publish/subscribe fan-out.
//!
//! Subscriptions are held in-process: each subscriber registers an async
//! [`TopicHandler`] callback under literal topics and/or glob patterns.
//! One pump task per distinct broker channel forwards events to the
//! matching handlers; when a broker stream ends (link reconnect) the pump
//! re-subscribes, replaying the active subscription.
//!
//! Publishing is fire-and-forget: it returns the number of in-process
//! subscribers registered for the topic at publish time. Zero means nobody
//! was live — callers needing at-least-once delivery fall back to the
//! reliable queue path.

use crate::broker::{pattern_matches, Broker, BrokerPool, BrokerStream};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Delay before a pump re-subscribes after its broker stream ends.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(250);

/// Callback invoked for every event delivered to a subscription.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn on_message(&self, topic: &str, payload: Value);
}

struct SubscriberEntry {
    topics: HashSet<String>,
    patterns: HashSet<String>,
    handler: Arc<dyn TopicHandler>,
}

struct Pump {
    refs: usize,
    handle: JoinHandle<()>,
}

/// Publish/subscribe fan-out over the broker.
pub struct PubSub {
    pool: Arc<BrokerPool>,
    subscribers: Arc<RwLock<HashMap<String, SubscriberEntry>>>,
    pumps: Mutex<HashMap<String, Pump>>,
}

impl PubSub {
    pub fn new(pool: Arc<BrokerPool>) -> Self {
        Self {
            pool,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            pumps: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `subscriber_id` for the given literal topics.
    ///
    /// Topics merge with any existing registration; the handler replaces
    /// the previous one.
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        topics: &[String],
        handler: Arc<dyn TopicHandler>,
    ) -> Result<()> {
        let added = self
            .register(subscriber_id, topics, false, handler)
            .await;
        for topic in added {
            self.ensure_pump(&topic, false).await?;
        }
        Ok(())
    }

    /// Registers `subscriber_id` for the given glob patterns.
    pub async fn psubscribe(
        &self,
        subscriber_id: &str,
        patterns: &[String],
        handler: Arc<dyn TopicHandler>,
    ) -> Result<()> {
        let added = self
            .register(subscriber_id, patterns, true, handler)
            .await;
        for pattern in added {
            self.ensure_pump(&pattern, true).await?;
        }
        Ok(())
    }

    /// Removes every subscription held by `subscriber_id`.
    pub async fn unsubscribe(&self, subscriber_id: &str) -> Result<()> {
        let entry = self.subscribers.write().await.remove(subscriber_id);
        if let Some(entry) = entry {
            for key in entry.topics.iter().chain(entry.patterns.iter()) {
                self.release_pump(key).await;
            }
        }
        Ok(())
    }

    /// Publishes a payload on a topic.
    ///
    /// Returns the number of in-process subscribers whose subscription
    /// matched at publish time.
    pub async fn publish(&self, topic: &str, payload: &Value) -> Result<usize> {
        let listeners = self.matching_subscribers(topic).await;
        let text = payload.to_string();
        self.pool.publish(topic, &text).await?;
        debug!(topic, listeners, "published");
        Ok(listeners)
    }

    /// Tears down every pump task. Registered subscribers stop receiving.
    pub async fn shutdown(&self) {
        let mut pumps = self.pumps.lock().await;
        for (_, pump) in pumps.drain() {
            pump.handle.abort();
        }
    }

    async fn matching_subscribers(&self, topic: &str) -> usize {
        let subscribers = self.subscribers.read().await;
        subscribers
            .values()
            .filter(|entry| {
                entry.topics.contains(topic)
                    || entry.patterns.iter().any(|p| pattern_matches(p, topic))
            })
            .count()
    }

    /// Merges keys into the subscriber entry, returning the newly added
    /// ones (those needing a pump reference).
    async fn register(
        &self,
        subscriber_id: &str,
        keys: &[String],
        as_patterns: bool,
        handler: Arc<dyn TopicHandler>,
    ) -> Vec<String> {
        let mut subscribers = self.subscribers.write().await;
        let entry = subscribers
            .entry(subscriber_id.to_string())
            .or_insert_with(|| SubscriberEntry {
                topics: HashSet::new(),
                patterns: HashSet::new(),
                handler: Arc::clone(&handler),
            });
        entry.handler = handler;
        let set = if as_patterns {
            &mut entry.patterns
        } else {
            &mut entry.topics
        };
        keys.iter()
            .filter(|key| set.insert((*key).to_string()))
            .cloned()
            .collect()
    }

    async fn ensure_pump(&self, key: &str, is_pattern: bool) -> Result<()> {
        let mut pumps = self.pumps.lock().await;
        if let Some(pump) = pumps.get_mut(key) {
            pump.refs += 1;
            return Ok(());
        }

        // Subscribe before returning so a publish immediately after
        // subscribe() cannot slip past the pump.
        let broker = self.pool.broker();
        let stream = if is_pattern {
            broker.psubscribe(key).await?
        } else {
            broker.subscribe(key).await?
        };
        let handle = tokio::spawn(pump_loop(
            broker,
            Arc::clone(&self.subscribers),
            key.to_string(),
            is_pattern,
            stream,
        ));
        pumps.insert(key.to_string(), Pump { refs: 1, handle });
        Ok(())
    }

    async fn release_pump(&self, key: &str) {
        let mut pumps = self.pumps.lock().await;
        if let Some(pump) = pumps.get_mut(key) {
            pump.refs -= 1;
            if pump.refs == 0 {
                if let Some(pump) = pumps.remove(key) {
                    pump.handle.abort();
                }
            }
        }
    }
}

/// Forwards broker events for one channel/pattern to matching handlers,
/// re-subscribing whenever the broker stream ends.
async fn pump_loop(
    broker: Arc<dyn Broker>,
    subscribers: Arc<RwLock<HashMap<String, SubscriberEntry>>>,
    key: String,
    is_pattern: bool,
    mut stream: BrokerStream,
) {
    loop {
        while let Some(event) = stream.next().await {
            let payload: Value = match serde_json::from_str(&event.payload) {
                Ok(value) => value,
                Err(err) => {
                    warn!(channel = %event.channel, "dropping unparseable event: {}", err);
                    continue;
                }
            };
            let handlers: Vec<Arc<dyn TopicHandler>> = {
                let subscribers = subscribers.read().await;
                subscribers
                    .values()
                    .filter(|entry| {
                        if is_pattern {
                            entry.patterns.contains(&key)
                        } else {
                            entry.topics.contains(&key)
                        }
                    })
                    .map(|entry| Arc::clone(&entry.handler))
                    .collect()
            };
            for handler in handlers {
                handler.on_message(&event.channel, payload.clone()).await;
            }
        }

        // Stream ended: broker link dropped. Replay the subscription.
        loop {
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            let attempt = if is_pattern {
                broker.psubscribe(&key).await
            } else {
                broker.subscribe(&key).await
            };
            match attempt {
                Ok(replayed) => {
                    debug!(key, "replayed subscription after broker reconnect");
                    stream = replayed;
                    break;
                }
                Err(err) => warn!(key, "resubscribe failed: {}", err),
            }
        }
    }
}
