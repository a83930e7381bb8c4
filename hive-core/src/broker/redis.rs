//! Redis broker backend for shared multi-process deployments.
//!
//! Commands run over a [`ConnectionManager`], which reconnects under the
//! hood; subscriptions open dedicated pub/sub connections and re-subscribe
//! in a loop when the link drops. The dequeue handoff (`zpop_min_to`) runs
//! as a Lua script so the pop and the processing-set insert are one atomic
//! broker operation.

use super::{Broker, BrokerEvent, BrokerStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

const POP_MIN_TO: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
redis.call('ZADD', KEYS[2], ARGV[1], popped[1])
return {popped[1], popped[2]}
"#;

/// Delay before a dropped pub/sub connection is reopened.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Broker backend over a shared Redis instance.
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
    pop_min_to: Script,
}

impl RedisBroker {
    /// Connects to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            Client::open(url).map_err(|err| Error::fatal(format!("invalid broker url: {}", err)))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(map_err)?;
        Ok(Self {
            client,
            conn,
            pop_min_to: Script::new(POP_MIN_TO),
        })
    }

    fn spawn_subscription(&self, target: String, is_pattern: bool) -> BrokerStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(err) => {
                        warn!(target, "pub/sub connection failed: {}", err);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };
                let subscribed = if is_pattern {
                    pubsub.psubscribe(&target).await
                } else {
                    pubsub.subscribe(&target).await
                };
                if let Err(err) = subscribed {
                    warn!(target, "subscribe failed: {}", err);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }

                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let payload: String = msg.get_payload().unwrap_or_default();
                    let event = BrokerEvent {
                        channel: msg.get_channel_name().to_string(),
                        payload,
                    };
                    if tx.send(event).is_err() {
                        // Subscriber dropped the stream; stop for good.
                        return;
                    }
                }
                // Connection dropped: reconnect and re-subscribe.
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
        BrokerStream::new(rx)
    }
}

/// Splits Redis failures along the retry boundary.
fn map_err(err: redis::RedisError) -> Error {
    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
        Error::transient(err.to_string())
    } else {
        Error::fatal(err.to_string())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(map_err),
            None => conn.set::<_, _, ()>(key, value).await.map_err(map_err),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1i64).await.map_err(map_err)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload).await.map_err(map_err)?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> Result<BrokerStream> {
        Ok(self.spawn_subscription(channel.to_string(), false))
    }

    async fn psubscribe(&self, pattern: &str) -> Result<BrokerStream> {
        Ok(self.spawn_subscription(pattern.to_string(), true))
    }

    async fn zadd(&self, key: &str, member: &str, score: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(map_err)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(key, member).await.map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<(String, u64)>> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(key)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(popped
            .into_iter()
            .next()
            .map(|(member, score)| (member, score as u64)))
    }

    async fn zpop_min_to(
        &self,
        src: &str,
        dst: &str,
        dst_score: u64,
    ) -> Result<Option<(String, u64)>> {
        let mut conn = self.conn.clone();
        let moved: Option<(String, f64)> = self
            .pop_min_to
            .key(src)
            .key(dst)
            .arg(dst_score)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(moved.map(|(member, score)| (member, score as u64)))
    }

    async fn zrange_below(&self, key: &str, max_score: u64) -> Result<Vec<(String, u64)>> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(key, 0u64, max_score)
            .await
            .map_err(map_err)?;
        Ok(entries
            .into_iter()
            .map(|(member, score)| (member, score as u64))
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.zcard(key).await.map_err(map_err)?;
        Ok(count.max(0) as usize)
    }
}
