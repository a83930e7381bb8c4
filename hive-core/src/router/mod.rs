//! Message router: the façade combining pub/sub fan-out and the reliable
//! queue.
//!
//! A direct send dual-writes by default: the message lands in the
//! recipient's reliable queue *and* is published on the recipient's topic
//! for anyone currently live. Broadcasts resolve workspace membership
//! through the [`WorkspaceDirectory`] collaborator and publish to each
//! member's topic plus the shared workspace channel — they never write
//! per-agent queues, a deliberate best-effort trade-off.

use crate::error::{Error, Result};
use crate::protocol::{
    agent_inbox, agent_topic, workspace_topic, AgentMessage, DeliveryMode, MessageType,
};
use crate::pubsub::{PubSub, TopicHandler};
use crate::queue::ReliableQueue;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Workspace membership lookup, owned by an external collaborator.
///
/// The bus trusts the `agent_id`/`workspace_id` pairs it is handed; any
/// credential checking happened at the entry layer.
#[async_trait]
pub trait WorkspaceDirectory: Send + Sync {
    async fn list_agents(&self, workspace_id: &str) -> Result<Vec<String>>;
}

/// In-process membership roster for single-node deployments and tests.
#[derive(Default)]
pub struct StaticDirectory {
    workspaces: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_agent(&self, workspace_id: &str, agent_id: &str) {
        self.workspaces
            .write()
            .await
            .entry(workspace_id.to_string())
            .or_default()
            .insert(agent_id.to_string());
    }

    pub async fn remove_agent(&self, workspace_id: &str, agent_id: &str) {
        if let Some(agents) = self.workspaces.write().await.get_mut(workspace_id) {
            agents.remove(agent_id);
        }
    }
}

#[async_trait]
impl WorkspaceDirectory for StaticDirectory {
    async fn list_agents(&self, workspace_id: &str) -> Result<Vec<String>> {
        let workspaces = self.workspaces.read().await;
        Ok(workspaces
            .get(workspace_id)
            .map(|agents| agents.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// The unified send/broadcast/subscribe surface of the bus.
pub struct MessageRouter {
    pubsub: Arc<PubSub>,
    queue: Arc<ReliableQueue>,
    directory: Arc<dyn WorkspaceDirectory>,
}

impl MessageRouter {
    pub fn new(
        pubsub: Arc<PubSub>,
        queue: Arc<ReliableQueue>,
        directory: Arc<dyn WorkspaceDirectory>,
    ) -> Self {
        Self {
            pubsub,
            queue,
            directory,
        }
    }

    /// Registers a handler for the given topics.
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        topics: &[String],
        handler: Arc<dyn TopicHandler>,
    ) -> Result<()> {
        self.pubsub.subscribe(subscriber_id, topics, handler).await
    }

    /// Drops every subscription held by `subscriber_id`.
    pub async fn unsubscribe(&self, subscriber_id: &str) -> Result<()> {
        self.pubsub.unsubscribe(subscriber_id).await
    }

    /// Routes a message to its recipient under the given delivery mode.
    ///
    /// Returns the message id once the reliable write (if any) succeeded;
    /// whether the message is ever consumed is an asynchronous concern.
    pub async fn send(&self, message: AgentMessage, mode: DeliveryMode) -> Result<String> {
        let to = message
            .to_agent
            .clone()
            .filter(|to| to != "*")
            .ok_or_else(|| Error::protocol("direct send requires a recipient"))?;
        let message_id = message.message_id.clone();

        if mode != DeliveryMode::PubSubOnly {
            self.queue.enqueue(&agent_inbox(&to), &message).await?;
        }
        if mode != DeliveryMode::QueueOnly {
            let payload = serde_json::to_value(&message)?;
            let listeners = self.pubsub.publish(&agent_topic(&to), &payload).await?;
            debug!(
                to,
                message_id = %message_id,
                listeners,
                "published direct message"
            );
        }
        Ok(message_id)
    }

    /// Builds a request message and dual-writes it.
    pub async fn send_direct(
        &self,
        from: &str,
        to: &str,
        workspace_id: &str,
        content: Value,
        priority: Option<u8>,
        ttl: Option<u64>,
    ) -> Result<String> {
        let mut message = AgentMessage::new(
            from,
            Some(to.to_string()),
            workspace_id,
            MessageType::Request,
            content,
        );
        if let Some(priority) = priority {
            message = message.with_priority(priority);
        }
        if let Some(ttl) = ttl {
            message = message.with_ttl(ttl);
        }
        self.send(message, DeliveryMode::Both).await
    }

    /// Publishes a notification to every workspace member except the
    /// sender, plus the shared workspace channel.
    ///
    /// Best-effort: members without a live subscription miss it.
    pub async fn broadcast(
        &self,
        from: &str,
        workspace_id: &str,
        content: Value,
        message_type: MessageType,
    ) -> Result<usize> {
        let agents = self.directory.list_agents(workspace_id).await?;
        let message = AgentMessage::new(from, None, workspace_id, message_type, content);
        let payload = serde_json::to_value(&message)?;

        let mut recipients = 0;
        for agent in agents.iter().filter(|agent| agent.as_str() != from) {
            self.pubsub.publish(&agent_topic(agent), &payload).await?;
            recipients += 1;
        }
        self.pubsub
            .publish(&workspace_topic(workspace_id), &payload)
            .await?;
        debug!(workspace_id, from, recipients, "broadcast");
        Ok(recipients)
    }

    /// Drains up to `limit` queued messages for an agent without blocking.
    ///
    /// Drained messages sit in the processing set until acknowledged, so a
    /// client that dies mid-flush does not lose them.
    pub async fn get_pending(&self, agent_id: &str, limit: usize) -> Result<Vec<AgentMessage>> {
        let queue = agent_inbox(agent_id);
        let mut drained = Vec::new();
        while drained.len() < limit {
            match self.queue.try_dequeue(&queue).await? {
                Some(message) => drained.push(message),
                None => break,
            }
        }
        Ok(drained)
    }

    /// Acknowledges a delivered message for an agent.
    pub async fn acknowledge(&self, agent_id: &str, message_id: &str) -> Result<()> {
        self.queue
            .acknowledge(&agent_inbox(agent_id), message_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerPool, BrokerPoolConfig, MemoryBroker};
    use crate::queue::QueueConfig;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Collector {
        tx: mpsc::UnboundedSender<(String, Value)>,
    }

    #[async_trait]
    impl TopicHandler for Collector {
        async fn on_message(&self, topic: &str, payload: Value) {
            let _ = self.tx.send((topic.to_string(), payload));
        }
    }

    fn collector() -> (Arc<Collector>, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Collector { tx }), rx)
    }

    fn router() -> (MessageRouter, Arc<StaticDirectory>, Arc<ReliableQueue>) {
        let pool = BrokerPool::new(Arc::new(MemoryBroker::new()), BrokerPoolConfig::default());
        let pubsub = Arc::new(PubSub::new(Arc::clone(&pool)));
        let queue = Arc::new(ReliableQueue::new(pool, QueueConfig::default()));
        let directory = Arc::new(StaticDirectory::new());
        let router = MessageRouter::new(
            pubsub,
            Arc::clone(&queue),
            Arc::clone(&directory) as Arc<dyn WorkspaceDirectory>,
        );
        (router, directory, queue)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<(String, Value)>) -> (String, Value) {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_send_direct_dual_writes() {
        let (router, _, queue) = router();
        let (handler, mut rx) = collector();
        router
            .subscribe("session-b", &[agent_topic("b")], handler)
            .await
            .unwrap();

        let id = router
            .send_direct("a", "b", "ws-1", json!({"hello": "b"}), None, None)
            .await
            .unwrap();

        // Live subscriber got the push.
        let (topic, payload) = recv(&mut rx).await;
        assert_eq!(topic, "agent:b");
        assert_eq!(payload["message_id"], json!(id));

        // The reliable copy waits in the queue as well.
        assert_eq!(queue.pending_depth(&agent_inbox("b")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delivery_modes() {
        let (router, _, queue) = router();

        let msg = AgentMessage::new(
            "a",
            Some("b".to_string()),
            "ws-1",
            MessageType::Command,
            json!({"n": 1}),
        );
        router.send(msg, DeliveryMode::QueueOnly).await.unwrap();
        assert_eq!(queue.pending_depth(&agent_inbox("b")).await.unwrap(), 1);

        let msg = AgentMessage::new(
            "a",
            Some("c".to_string()),
            "ws-1",
            MessageType::Command,
            json!({"n": 2}),
        );
        router.send(msg, DeliveryMode::PubSubOnly).await.unwrap();
        assert_eq!(queue.pending_depth(&agent_inbox("c")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_requires_recipient() {
        let (router, _, _) = router();
        let msg = AgentMessage::new("a", None, "ws-1", MessageType::Request, json!({}));
        let err = router.send(msg, DeliveryMode::Both).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_live_members_only() {
        let (router, directory, queue) = router();
        for agent in ["a", "b", "c"] {
            directory.register_agent("ws-1", agent).await;
        }

        let mut receivers = Vec::new();
        for agent in ["a", "b", "c"] {
            let (handler, rx) = collector();
            router
                .subscribe(&format!("session-{}", agent), &[agent_topic(agent)], handler)
                .await
                .unwrap();
            receivers.push(rx);
        }

        let count = router
            .broadcast("operator", "ws-1", json!({"note": "deploy"}), MessageType::Notification)
            .await
            .unwrap();
        assert_eq!(count, 3);

        for rx in receivers.iter_mut() {
            let (_, payload) = recv(rx).await;
            assert_eq!(payload["content"], json!({"note": "deploy"}));
            assert_eq!(payload["message_type"], json!("notification"));
        }

        // Broadcasts never land in reliable queues.
        for agent in ["a", "b", "c"] {
            assert_eq!(queue.pending_depth(&agent_inbox(agent)).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let (router, directory, _) = router();
        for agent in ["a", "b", "c"] {
            directory.register_agent("ws-1", agent).await;
        }
        let count = router
            .broadcast("a", "ws-1", json!({}), MessageType::Notification)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_get_pending_drains_in_priority_order() {
        let (router, _, _) = router();
        for (priority, n) in [(3u8, 1), (9, 2), (5, 3)] {
            let msg = AgentMessage::new(
                "a",
                Some("b".to_string()),
                "ws-1",
                MessageType::Request,
                json!({ "n": n }),
            )
            .with_priority(priority);
            router.send(msg, DeliveryMode::QueueOnly).await.unwrap();
        }

        let drained = router.get_pending("b", 10).await.unwrap();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].content, json!({"n": 2}));
        assert_eq!(drained[1].content, json!({"n": 3}));
        assert_eq!(drained[2].content, json!({"n": 1}));

        for message in &drained {
            router.acknowledge("b", &message.message_id).await.unwrap();
        }
        assert_eq!(router.get_pending("b", 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_get_pending_respects_limit() {
        let (router, _, queue) = router();
        for n in 0..5 {
            let msg = AgentMessage::new(
                "a",
                Some("b".to_string()),
                "ws-1",
                MessageType::Request,
                json!({ "n": n }),
            );
            router.send(msg, DeliveryMode::QueueOnly).await.unwrap();
        }

        let drained = router.get_pending("b", 2).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.pending_depth(&agent_inbox("b")).await.unwrap(), 3);
    }
}
