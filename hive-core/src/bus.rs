//! The bus instance.
//!
//! One explicit object constructed at process start and handed by
//! reference to everything that needs it — no module-level singleton.
//! Owns the broker pool, fan-out, queue, router, health monitor, and
//! session registry, and spawns their background loops. Shutdown drains in
//! order: live sessions close first, the broker pool last, so no component
//! writes after the link is gone.

use crate::broker::{Broker, BrokerPool};
use crate::config::BusConfig;
use crate::connection::{LiveServer, SessionRegistry};
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::pubsub::PubSub;
use crate::queue::ReliableQueue;
use crate::router::{MessageRouter, WorkspaceDirectory};
use std::sync::Arc;
use tracing::info;

/// A running collaboration bus.
pub struct Bus {
    pool: Arc<BrokerPool>,
    pubsub: Arc<PubSub>,
    queue: Arc<ReliableQueue>,
    router: Arc<MessageRouter>,
    health: Arc<HealthMonitor>,
    sessions: Arc<SessionRegistry>,
}

impl Bus {
    /// Wires every component over the given broker backend and starts the
    /// background loops (queue sweeper, session reaper, health probes).
    pub fn start(
        config: &BusConfig,
        broker: Arc<dyn Broker>,
        directory: Arc<dyn WorkspaceDirectory>,
    ) -> Arc<Self> {
        let pool = BrokerPool::new(broker, config.broker_pool());
        let pubsub = Arc::new(PubSub::new(Arc::clone(&pool)));
        let queue = Arc::new(ReliableQueue::new(Arc::clone(&pool), config.queue_config()));
        Arc::clone(&queue).spawn_sweeper();

        let router = Arc::new(MessageRouter::new(
            Arc::clone(&pubsub),
            Arc::clone(&queue),
            directory,
        ));

        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&pool),
            Arc::clone(&queue),
            config.health_config(),
        ));
        Arc::clone(&health).spawn();

        let sessions = Arc::new(SessionRegistry::new(config.session_config()));
        Arc::clone(&sessions).spawn_reaper();

        info!("bus started");
        Arc::new(Self {
            pool,
            pubsub,
            queue,
            router,
            health,
            sessions,
        })
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn queue(&self) -> &Arc<ReliableQueue> {
        &self.queue
    }

    pub fn pubsub(&self) -> &Arc<PubSub> {
        &self.pubsub
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn pool(&self) -> &Arc<BrokerPool> {
        &self.pool
    }

    /// Builds the live connection layer over this bus.
    pub fn live_server(&self) -> Arc<LiveServer> {
        Arc::new(LiveServer::new(
            Arc::clone(&self.sessions),
            Arc::clone(&self.router),
        ))
    }

    /// Serves live WebSocket sessions on `addr` until cancelled.
    pub async fn serve(&self, addr: &str) -> Result<()> {
        self.live_server().serve(addr).await
    }

    /// Graceful stop: close sessions (notifying clients), stop the
    /// background loops, then close the broker pool.
    pub async fn shutdown(&self) {
        self.sessions.stop_reaper();
        self.sessions.close_all().await;
        self.pubsub.shutdown().await;
        self.health.stop();
        self.queue.stop_sweeper();
        self.pool.close();
        info!("bus shut down");
    }
}
