//! WebSocket serving for the live connection layer.
//!
//! Accepts long-lived sessions, identifies them from pre-validated query
//! parameters (authentication happened at the entry layer), flushes the
//! reliable-queue backlog on open, subscribes the session to its agent and
//! workspace topics, and dispatches inbound frames by tag. A malformed
//! frame closes that one connection with an `error` frame; everything else
//! keeps running.

use super::SessionRegistry;
use crate::error::{Error, Result};
use crate::protocol::{
    agent_topic, workspace_topic, AgentMessage, ChatPayload, ClientFrame, ConnectedData,
    DeliveryMode, MessageType, ServerFrame,
};
use crate::pubsub::TopicHandler;
use crate::router::MessageRouter;
use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

/// Who a session claims to be, read from the handshake query string.
#[derive(Debug, Default, Clone)]
struct Identity {
    agent_id: Option<String>,
    user_id: Option<String>,
    workspace_id: Option<String>,
}

impl Identity {
    fn from_query(query: &str) -> Self {
        let mut identity = Identity::default();
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("");
            if value.is_empty() {
                continue;
            }
            match key {
                "agent_id" => identity.agent_id = Some(value.to_string()),
                "user_id" => identity.user_id = Some(value.to_string()),
                "workspace_id" => identity.workspace_id = Some(value.to_string()),
                _ => {}
            }
        }
        identity
    }
}

/// Pushes routed messages into one session, tearing it down on a stuck
/// outbound channel.
struct SessionPushHandler {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

#[async_trait]
impl TopicHandler for SessionPushHandler {
    async fn on_message(&self, _topic: &str, payload: Value) {
        let frame = match serde_json::from_value::<AgentMessage>(payload.clone()) {
            Ok(message) => ServerFrame::from_message(&message),
            Err(_) => ServerFrame::Notification { data: payload },
        };
        if self.registry.push(&self.session_id, frame).await.is_err() {
            self.registry.deregister(&self.session_id).await;
        }
    }
}

/// Accept loop and per-session dispatch for live WebSocket clients.
pub struct LiveServer {
    registry: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
}

impl LiveServer {
    pub fn new(registry: Arc<SessionRegistry>, router: Arc<MessageRouter>) -> Self {
        Self { registry, router }
    }

    /// Binds the address and serves sessions until the task is cancelled.
    pub async fn serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("live connection layer listening on {}", addr);
        self.run(listener).await
    }

    /// Serves sessions from an already-bound listener.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.handle_socket(stream).await {
                    debug!(%peer, "session ended: {}", err);
                }
            });
        }
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let mut identity = Identity::default();
        let ws = accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                identity = Identity::from_query(req.uri().query().unwrap_or(""));
                Ok(resp)
            },
        )
        .await
        .map_err(|err| Error::connection(format!("websocket handshake failed: {}", err)))?;

        let (session_id, rx) = self
            .registry
            .register(
                identity.agent_id.clone(),
                identity.user_id.clone(),
                identity.workspace_id.clone(),
            )
            .await;
        let (sink, mut inbound) = ws.split();
        self.spawn_outbound(sink, rx);

        let result = self.run_session(&session_id, &identity, &mut inbound).await;

        let _ = self.router.unsubscribe(&session_id).await;
        self.registry.deregister(&session_id).await;
        result
    }

    async fn run_session(
        &self,
        session_id: &str,
        identity: &Identity,
        inbound: &mut SplitStream<WebSocketStream<TcpStream>>,
    ) -> Result<()> {
        self.registry.open(session_id).await;
        self.registry
            .push(
                session_id,
                ServerFrame::Connected {
                    data: ConnectedData {
                        session_id: session_id.to_string(),
                    },
                },
            )
            .await?;

        let handler: Arc<dyn TopicHandler> = Arc::new(SessionPushHandler {
            registry: Arc::clone(&self.registry),
            session_id: session_id.to_string(),
        });

        if let Some(agent_id) = identity.agent_id.clone() {
            let mut topics = vec![agent_topic(&agent_id)];
            if let Some(workspace_id) = &identity.workspace_id {
                topics.push(workspace_topic(workspace_id));
            }
            self.registry.add_subscriptions(session_id, &topics).await;
            self.router
                .subscribe(session_id, &topics, Arc::clone(&handler))
                .await?;
            self.flush_backlog(session_id, &agent_id).await;
        }

        self.drive_session(session_id, identity, inbound, &handler).await
    }

    /// Serializes queued frames onto the socket and sends heartbeat pings.
    /// Any write failure ends the pump; the inbound side then observes the
    /// closed transport and tears the session down.
    fn spawn_outbound(
        &self,
        mut sink: futures::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>,
        mut rx: mpsc::Receiver<ServerFrame>,
    ) {
        let heartbeat = self.registry.config().heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            let text = match serde_json::to_string(&frame) {
                                Ok(text) => text,
                                Err(err) => {
                                    warn!("dropping unserializable frame: {}", err);
                                    continue;
                                }
                            };
                            if sink.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Pushes the reliable backlog accumulated while the agent was
    /// offline. Each message is acknowledged once it reaches the session
    /// buffer; a stalled session leaves the rest in processing for the
    /// sweeper.
    async fn flush_backlog(&self, session_id: &str, agent_id: &str) {
        let limit = self.registry.config().backlog_limit;
        let backlog = match self.router.get_pending(agent_id, limit).await {
            Ok(backlog) => backlog,
            Err(err) => {
                warn!(agent_id, "backlog flush failed: {}", err);
                return;
            }
        };
        let count = backlog.len();
        for message in backlog {
            let frame = ServerFrame::from_message(&message);
            if self.registry.push(session_id, frame).await.is_err() {
                return;
            }
            if let Err(err) = self
                .router
                .acknowledge(agent_id, &message.message_id)
                .await
            {
                warn!(agent_id, message_id = %message.message_id, "backlog ack failed: {}", err);
            }
        }
        if count > 0 {
            debug!(agent_id, count, "flushed backlog");
        }
    }

    async fn drive_session(
        &self,
        session_id: &str,
        identity: &Identity,
        inbound: &mut SplitStream<WebSocketStream<TcpStream>>,
        handler: &Arc<dyn TopicHandler>,
    ) -> Result<()> {
        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    self.registry.touch(session_id).await;
                    let frame: ClientFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(err) => {
                            let _ = self
                                .registry
                                .push(
                                    session_id,
                                    ServerFrame::error(format!("malformed frame: {}", err)),
                                )
                                .await;
                            return Err(Error::protocol(format!(
                                "malformed client frame: {}",
                                err
                            )));
                        }
                    };
                    self.handle_frame(session_id, identity, frame, handler).await;
                }
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {
                    self.registry.touch(session_id).await;
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    return Err(Error::connection(format!("transport error: {}", err)));
                }
            }
        }
        Ok(())
    }

    async fn handle_frame(
        &self,
        session_id: &str,
        identity: &Identity,
        frame: ClientFrame,
        handler: &Arc<dyn TopicHandler>,
    ) {
        match frame {
            ClientFrame::Ping => {
                let _ = self.registry.push(session_id, ServerFrame::Pong).await;
            }
            ClientFrame::Subscribe { channels } => {
                self.registry.add_subscriptions(session_id, &channels).await;
                if let Err(err) = self
                    .router
                    .subscribe(session_id, &channels, Arc::clone(handler))
                    .await
                {
                    let _ = self
                        .registry
                        .push(
                            session_id,
                            ServerFrame::error(format!("subscribe failed: {}", err)),
                        )
                        .await;
                }
            }
            ClientFrame::Chat { payload } => {
                self.handle_chat(session_id, identity, payload).await;
            }
        }
    }

    async fn handle_chat(&self, session_id: &str, identity: &Identity, payload: ChatPayload) {
        let (agent_id, workspace_id) = match (&identity.agent_id, &identity.workspace_id) {
            (Some(agent_id), Some(workspace_id)) => (agent_id.clone(), workspace_id.clone()),
            _ => {
                let _ = self
                    .registry
                    .push(
                        session_id,
                        ServerFrame::error("chat requires an agent identity"),
                    )
                    .await;
                return;
            }
        };

        let outcome = match payload.to_agent {
            Some(to) => {
                let mut message = AgentMessage::new(
                    &agent_id,
                    Some(to),
                    &workspace_id,
                    payload.message_type.unwrap_or(MessageType::Request),
                    payload.content,
                );
                if let Some(priority) = payload.priority {
                    message = message.with_priority(priority);
                }
                if let Some(ttl) = payload.ttl {
                    message = message.with_ttl(ttl);
                }
                self.router.send(message, DeliveryMode::Both).await.map(|_| ())
            }
            None => self
                .router
                .broadcast(
                    &agent_id,
                    &workspace_id,
                    payload.content,
                    payload.message_type.unwrap_or(MessageType::Notification),
                )
                .await
                .map(|_| ()),
        };

        if let Err(err) = outcome {
            let _ = self
                .registry
                .push(session_id, ServerFrame::error(format!("send failed: {}", err)))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerPool, BrokerPoolConfig, MemoryBroker};
    use crate::connection::SessionConfig;
    use crate::protocol::agent_inbox;
    use crate::pubsub::PubSub;
    use crate::queue::{QueueConfig, ReliableQueue};
    use crate::router::{StaticDirectory, WorkspaceDirectory};
    use serde_json::json;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio::time::timeout;

    struct Harness {
        base_url: String,
        registry: Arc<SessionRegistry>,
        router: Arc<MessageRouter>,
        queue: Arc<ReliableQueue>,
        directory: Arc<StaticDirectory>,
    }

    async fn start_server() -> Harness {
        let pool = BrokerPool::new(Arc::new(MemoryBroker::new()), BrokerPoolConfig::default());
        let pubsub = Arc::new(PubSub::new(Arc::clone(&pool)));
        let queue = Arc::new(ReliableQueue::new(pool, QueueConfig::default()));
        let directory = Arc::new(StaticDirectory::new());
        let router = Arc::new(MessageRouter::new(
            pubsub,
            Arc::clone(&queue),
            Arc::clone(&directory) as Arc<dyn WorkspaceDirectory>,
        ));
        let registry = Arc::new(SessionRegistry::new(SessionConfig::default()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(LiveServer::new(
            Arc::clone(&registry),
            Arc::clone(&router),
        ));
        tokio::spawn(server.run(listener));

        Harness {
            base_url: format!("ws://{}", addr),
            registry,
            router,
            queue,
            directory,
        }
    }

    type WsClient = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    async fn connect(harness: &Harness, query: &str) -> WsClient {
        let url = format!("{}/ws?{}", harness.base_url, query);
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    /// Reads the next text frame, skipping transport ping/pong noise.
    async fn recv_frame(ws: &mut WsClient) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn send_frame(ws: &mut WsClient, frame: Value) {
        ws.send(WsMessage::Text(frame.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let harness = start_server().await;
        let mut ws = connect(&harness, "agent_id=a&workspace_id=w1").await;

        let frame = recv_frame(&mut ws).await;
        assert_eq!(frame["type"], json!("connected"));
        assert!(frame["data"]["session_id"].is_string());
        assert_eq!(harness.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let harness = start_server().await;
        let mut ws = connect(&harness, "agent_id=a&workspace_id=w1").await;
        let _ = recv_frame(&mut ws).await;

        send_frame(&mut ws, json!({"type": "ping"})).await;
        let frame = recv_frame(&mut ws).await;
        assert_eq!(frame["type"], json!("pong"));
    }

    #[tokio::test]
    async fn test_chat_routes_to_recipient_session() {
        let harness = start_server().await;
        let mut sender = connect(&harness, "agent_id=a&workspace_id=w1").await;
        let mut recipient = connect(&harness, "agent_id=b&workspace_id=w1").await;
        let _ = recv_frame(&mut sender).await;
        let _ = recv_frame(&mut recipient).await;

        send_frame(
            &mut sender,
            json!({"type": "chat", "payload": {"to_agent": "b", "content": {"text": "hello"}}}),
        )
        .await;

        let frame = recv_frame(&mut recipient).await;
        assert_eq!(frame["type"], json!("message"));
        assert_eq!(frame["data"]["content"], json!({"text": "hello"}));
        assert_eq!(frame["data"]["from_agent"], json!("a"));
    }

    #[tokio::test]
    async fn test_backlog_flushed_on_connect() {
        let harness = start_server().await;

        // Message sent while the recipient was offline.
        let msg = AgentMessage::new(
            "a",
            Some("b".to_string()),
            "w1",
            MessageType::Request,
            json!({"queued": true}),
        );
        harness
            .router
            .send(msg, DeliveryMode::QueueOnly)
            .await
            .unwrap();

        let mut ws = connect(&harness, "agent_id=b&workspace_id=w1").await;
        let _ = recv_frame(&mut ws).await;
        let frame = recv_frame(&mut ws).await;
        assert_eq!(frame["type"], json!("message"));
        assert_eq!(frame["data"]["content"], json!({"queued": true}));

        // The flushed message was acknowledged out of the queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            harness.queue.pending_depth(&agent_inbox("b")).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let harness = start_server().await;
        let mut ws = connect(&harness, "agent_id=a&workspace_id=w1").await;
        let _ = recv_frame(&mut ws).await;

        ws.send(WsMessage::Text("this is not json".to_string()))
            .await
            .unwrap();

        let frame = recv_frame(&mut ws).await;
        assert_eq!(frame["type"], json!("error"));

        // The server closes this one session after the error frame.
        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    None | Some(Ok(WsMessage::Close(_))) | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_subscribe_frame_adds_channels() {
        let harness = start_server().await;
        let mut ws = connect(&harness, "").await;
        let _ = recv_frame(&mut ws).await;

        send_frame(
            &mut ws,
            json!({"type": "subscribe", "channels": ["workspace:w9"]}),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        harness.directory.register_agent("w9", "x").await;
        harness
            .router
            .broadcast("operator", "w9", json!({"note": "hi"}), MessageType::Notification)
            .await
            .unwrap();

        let frame = recv_frame(&mut ws).await;
        assert_eq!(frame["type"], json!("notification"));
        assert_eq!(frame["data"]["content"], json!({"note": "hi"}));
    }
}
