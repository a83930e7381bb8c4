//! Live connection layer: long-lived client sessions.
//!
//! Each connected agent or UI client gets one [`Session`], owned
//! exclusively by the [`SessionRegistry`] — an arena map behind a single
//! lock, referenced only by opaque session ids so no other component ever
//! holds the underlying socket. Outgoing frames flow through a bounded
//! per-session channel; a write failure tears down that one session and
//! never touches the rest of the bus.
//!
//! Liveness follows the heartbeat contract: any client activity refreshes
//! `last_heartbeat`, and the reaper removes sessions idle past the timeout
//! window — never before it.

mod server;

pub use server::LiveServer;

use crate::error::{Error, Result};
use crate::protocol::ServerFrame;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Duration between server-initiated heartbeat pings (and reaper passes).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Idle time after which a session is considered dead.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between heartbeat pings and reaper passes
    pub heartbeat_interval: Duration,
    /// Idle window after which a session is reaped
    pub idle_timeout: Duration,
    /// Outbound frame buffer per session
    pub buffer_size: usize,
    /// Maximum queued messages flushed on (re)connect
    pub backlog_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            idle_timeout: SESSION_TIMEOUT,
            buffer_size: 64,
            backlog_limit: 100,
        }
    }
}

/// Lifecycle of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One live client session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    subscriptions: HashSet<String>,
    last_heartbeat: Instant,
    metadata: HashMap<String, Value>,
    state: SessionState,
    tx: mpsc::Sender<ServerFrame>,
}

impl Session {
    /// Whether the session has seen activity within the timeout window.
    pub fn is_alive(&self, idle_timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() < idle_timeout
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }
}

/// Arena of live sessions behind a single lock.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    config: SessionConfig,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            reaper: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Creates a session in the `Connecting` state and hands back its id
    /// plus the receiving end of its outbound frame channel.
    pub async fn register(
        &self,
        agent_id: Option<String>,
        user_id: Option<String>,
        workspace_id: Option<String>,
    ) -> (String, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(self.config.buffer_size);
        let id = uuid::Uuid::new_v4().to_string();
        let session = Session {
            id: id.clone(),
            agent_id,
            user_id,
            workspace_id,
            subscriptions: HashSet::new(),
            last_heartbeat: Instant::now(),
            metadata: HashMap::new(),
            state: SessionState::Connecting,
            tx,
        };
        self.sessions.write().await.insert(id.clone(), session);
        debug!(session_id = %id, "session registered");
        (id, rx)
    }

    /// Marks a session open after the transport handshake completed.
    pub async fn open(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.state = SessionState::Open;
        }
    }

    /// Removes a session; dropping its sender closes the outbound pump.
    pub async fn deregister(&self, session_id: &str) -> Option<Session> {
        let mut removed = self.sessions.write().await.remove(session_id);
        if let Some(session) = removed.as_mut() {
            session.state = SessionState::Closed;
            debug!(session_id, "session deregistered");
        }
        removed
    }

    /// Refreshes the heartbeat timestamp on client activity.
    pub async fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_heartbeat = Instant::now();
        }
    }

    /// Records extra channel subscriptions on the session.
    pub async fn add_subscriptions(&self, session_id: &str, channels: &[String]) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            for channel in channels {
                session.subscriptions.insert(channel.clone());
            }
        }
    }

    /// Attaches a metadata entry to the session.
    pub async fn set_metadata(&self, session_id: &str, key: &str, value: Value) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.metadata.insert(key.to_string(), value);
        }
    }

    /// Queues a frame for one session.
    ///
    /// A full or closed channel means the client stopped draining; the
    /// caller tears that session down, leaving every other session intact.
    pub async fn push(&self, session_id: &str, frame: ServerFrame) -> Result<()> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| Error::connection(format!("no such session: {}", session_id)))?;
        session
            .tx
            .try_send(frame)
            .map_err(|_| Error::connection(format!("session {} not draining", session_id)))
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Removes sessions idle past the timeout window, returning their ids.
    pub async fn reap_idle(&self) -> Vec<String> {
        let idle_timeout = self.config.idle_timeout;
        let mut sessions = self.sessions.write().await;
        let dead: Vec<String> = sessions
            .values()
            .filter(|session| !session.is_alive(idle_timeout))
            .map(|session| session.id.clone())
            .collect();
        for id in &dead {
            sessions.remove(id);
            warn!(session_id = %id, "session reaped after heartbeat timeout");
        }
        dead
    }

    /// Starts the periodic reaper.
    pub fn spawn_reaper(self: Arc<Self>) {
        let registry = Arc::clone(&self);
        let interval = self.config.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.reap_idle().await;
            }
        });
        *self.reaper.lock().expect("reaper lock poisoned") = Some(handle);
    }

    /// Stops the periodic reaper.
    pub fn stop_reaper(&self) {
        if let Some(handle) = self.reaper.lock().expect("reaper lock poisoned").take() {
            handle.abort();
        }
    }

    /// Closes every session, notifying clients that still drain frames.
    /// Part of graceful shutdown: runs before the broker pool closes.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        for (_, session) in sessions.iter_mut() {
            session.state = SessionState::Closing;
            let _ = session
                .tx
                .try_send(ServerFrame::error("server shutting down"));
        }
        sessions.clear();
        if count > 0 {
            info!(count, "closed all live sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(80),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (id, mut rx) = registry
            .register(Some("agent-a".to_string()), None, Some("ws-1".to_string()))
            .await;
        registry.open(&id).await;
        assert_eq!(registry.len().await, 1);

        registry
            .push(&id, ServerFrame::error("just testing"))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ServerFrame::Error { .. })));

        let session = registry.deregister(&id).await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_push_to_unknown_session_fails() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let err = registry
            .push("nope", ServerFrame::Pong)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_reaper_respects_timeout_window() {
        let registry = SessionRegistry::new(fast_config());
        let (id, _rx) = registry.register(None, None, None).await;

        // Alive well inside the window: never reaped early.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.reap_idle().await.is_empty());

        // Activity resets the window.
        registry.touch(&id).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(registry.reap_idle().await.is_empty());

        // Past the timeout the session goes away.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.reap_idle().await, vec![id.clone()]);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_spawned_reaper_tears_down_silent_sessions() {
        let registry = Arc::new(SessionRegistry::new(fast_config()));
        Arc::clone(&registry).spawn_reaper();
        let (_id, mut rx) = registry.register(None, None, None).await;

        // Silent session: reaped within timeout + one interval.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.is_empty().await);
        // Dropped sender ends the outbound channel.
        assert!(rx.recv().await.is_none());
        registry.stop_reaper();
    }

    #[tokio::test]
    async fn test_close_all_notifies_and_clears() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (_a, mut rx_a) = registry.register(None, None, None).await;
        let (_b, mut rx_b) = registry.register(None, None, None).await;

        registry.close_all().await;
        assert!(registry.is_empty().await);
        assert!(matches!(rx_a.recv().await, Some(ServerFrame::Error { .. })));
        assert!(matches!(rx_b.recv().await, Some(ServerFrame::Error { .. })));
    }

    #[tokio::test]
    async fn test_subscriptions_tracked() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let (id, _rx) = registry.register(None, None, None).await;
        registry
            .add_subscriptions(&id, &["workspace:w1".to_string(), "agent:a".to_string()])
            .await;

        let sessions = registry.sessions.read().await;
        let session = sessions.get(&id).unwrap();
        let subs: HashSet<&str> = session.subscriptions().collect();
        assert!(subs.contains("workspace:w1"));
        assert!(subs.contains("agent:a"));
    }
}
