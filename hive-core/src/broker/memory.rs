//! In-process broker backend.
//!
//! Implements the full [`Broker`] contract over process-local maps: a KV
//! table with lazy TTL expiry, `BTreeSet`-ordered sorted sets, and a
//! subscription list with glob pattern support. Serves single-node
//! deployments and is the test substrate for every layer above.

use super::{pattern_matches, Broker, BrokerEvent, BrokerStream};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

struct SubEntry {
    pattern: String,
    is_pattern: bool,
    tx: mpsc::UnboundedSender<BrokerEvent>,
}

impl SubEntry {
    fn matches(&self, channel: &str) -> bool {
        if self.is_pattern {
            pattern_matches(&self.pattern, channel)
        } else {
            self.pattern == channel
        }
    }
}

/// Broker backend backed by process-local state.
#[derive(Default)]
pub struct MemoryBroker {
    kv: RwLock<HashMap<String, KvEntry>>,
    // (score, member) pairs; BTreeSet ordering gives pop-minimum directly.
    zsets: RwLock<HashMap<String, BTreeSet<(u64, String)>>>,
    subs: RwLock<Vec<SubEntry>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut kv = self.kv.write().await;
        let expired = kv.get(key).map(KvEntry::is_expired);
        match expired {
            Some(true) => {
                kv.remove(key);
                Ok(None)
            }
            Some(false) => Ok(kv.get(key).map(|entry| entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let entry = KvEntry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.kv.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.kv.write().await.remove(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut kv = self.kv.write().await;
        let current = kv
            .get(key)
            .filter(|entry| !entry.is_expired())
            .and_then(|entry| entry.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        kv.insert(
            key.to_string(),
            KvEntry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut subs = self.subs.write().await;
        let mut delivered = 0;
        subs.retain(|sub| {
            if !sub.matches(channel) {
                return true;
            }
            let event = BrokerEvent {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            // A closed receiver means the subscription was dropped.
            match sub.tx.send(event) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.write().await.push(SubEntry {
            pattern: channel.to_string(),
            is_pattern: false,
            tx,
        });
        Ok(BrokerStream::new(rx))
    }

    async fn psubscribe(&self, pattern: &str) -> Result<BrokerStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.write().await.push(SubEntry {
            pattern: pattern.to_string(),
            is_pattern: true,
            tx,
        });
        Ok(BrokerStream::new(rx))
    }

    async fn zadd(&self, key: &str, member: &str, score: u64) -> Result<()> {
        let mut zsets = self.zsets.write().await;
        let set = zsets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        set.insert((score, member.to_string()));
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut zsets = self.zsets.write().await;
        match zsets.get_mut(key) {
            Some(set) => {
                let before = set.len();
                set.retain(|(_, m)| m != member);
                Ok(set.len() < before)
            }
            None => Ok(false),
        }
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<(String, u64)>> {
        let mut zsets = self.zsets.write().await;
        let set = match zsets.get_mut(key) {
            Some(set) => set,
            None => return Ok(None),
        };
        let first = match set.iter().next().cloned() {
            Some(first) => first,
            None => return Ok(None),
        };
        set.remove(&first);
        let (score, member) = first;
        Ok(Some((member, score)))
    }

    async fn zpop_min_to(
        &self,
        src: &str,
        dst: &str,
        dst_score: u64,
    ) -> Result<Option<(String, u64)>> {
        // One lock over all sorted sets makes the pop-and-move atomic.
        let mut zsets = self.zsets.write().await;
        let first = match zsets.get_mut(src).and_then(|set| {
            let first = set.iter().next().cloned();
            if let Some(entry) = &first {
                set.remove(entry);
            }
            first
        }) {
            Some(first) => first,
            None => return Ok(None),
        };
        let (score, member) = first;
        let dst_set = zsets.entry(dst.to_string()).or_default();
        dst_set.retain(|(_, m)| m != &member);
        dst_set.insert((dst_score, member.clone()));
        Ok(Some((member, score)))
    }

    async fn zrange_below(&self, key: &str, max_score: u64) -> Result<Vec<(String, u64)>> {
        let zsets = self.zsets.read().await;
        let set = match zsets.get(key) {
            Some(set) => set,
            None => return Ok(Vec::new()),
        };
        Ok(set
            .iter()
            .take_while(|(score, _)| *score <= max_score)
            .map(|(score, member)| (member.clone(), *score))
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let zsets = self.zsets.read().await;
        Ok(zsets.get(key).map(|set| set.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kv_roundtrip_and_ttl() {
        let broker = MemoryBroker::new();
        broker.set("k", "v", None).await.unwrap();
        assert_eq!(broker.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(broker.delete("k").await.unwrap());
        assert!(!broker.delete("k").await.unwrap());

        broker
            .set("short", "lived", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.incr("n").await.unwrap(), 1);
        assert_eq!(broker.incr("n").await.unwrap(), 2);
        assert_eq!(broker.incr("n").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sorted_set_ordering() {
        let broker = MemoryBroker::new();
        broker.zadd("q", "late", 30).await.unwrap();
        broker.zadd("q", "early", 10).await.unwrap();
        broker.zadd("q", "mid", 20).await.unwrap();

        assert_eq!(broker.zcard("q").await.unwrap(), 3);
        let (member, score) = broker.zpop_min("q").await.unwrap().unwrap();
        assert_eq!((member.as_str(), score), ("early", 10));
        let (member, _) = broker.zpop_min("q").await.unwrap().unwrap();
        assert_eq!(member, "mid");
    }

    #[tokio::test]
    async fn test_zadd_replaces_score() {
        let broker = MemoryBroker::new();
        broker.zadd("q", "m", 50).await.unwrap();
        broker.zadd("q", "m", 5).await.unwrap();
        assert_eq!(broker.zcard("q").await.unwrap(), 1);
        let (_, score) = broker.zpop_min("q").await.unwrap().unwrap();
        assert_eq!(score, 5);
    }

    #[tokio::test]
    async fn test_zpop_min_to_moves_atomically() {
        let broker = MemoryBroker::new();
        broker.zadd("pending", "m1", 10).await.unwrap();

        let popped = broker.zpop_min_to("pending", "processing", 99).await.unwrap();
        assert_eq!(popped, Some(("m1".to_string(), 10)));
        assert_eq!(broker.zcard("pending").await.unwrap(), 0);
        assert_eq!(
            broker.zrange_below("processing", 100).await.unwrap(),
            vec![("m1".to_string(), 99)]
        );

        assert_eq!(broker.zpop_min_to("pending", "processing", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_publish_counts_matching_subscriptions() {
        let broker = MemoryBroker::new();
        let mut literal = broker.subscribe("agent:a1").await.unwrap();
        let mut pattern = broker.psubscribe("agent:*").await.unwrap();
        let _other = broker.subscribe("agent:a2").await.unwrap();

        let delivered = broker.publish("agent:a1", "hello").await.unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(literal.next().await.unwrap().payload, "hello");
        let event = pattern.next().await.unwrap();
        assert_eq!(event.channel, "agent:a1");
    }

    #[tokio::test]
    async fn test_dropped_subscription_pruned() {
        let broker = MemoryBroker::new();
        let stream = broker.subscribe("t").await.unwrap();
        drop(stream);
        assert_eq!(broker.publish("t", "x").await.unwrap(), 0);
    }
}
