//! Hive bus server
//! Wires a bus instance from config and serves live WebSocket sessions.

use clap::Parser;
use console::style;
use hive_core::broker::{Broker, MemoryBroker};
use hive_core::{Bus, BusConfig, StaticDirectory, WorkspaceDirectory};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about = "Agent collaboration bus server", long_about = None)]
struct Cli {
    /// Address for the live WebSocket listener
    #[arg(short, long, default_value = "127.0.0.1:9800")]
    addr: String,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<String>,

    /// Broker URL override (memory:// or redis://host:port)
    #[arg(long)]
    broker_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => BusConfig::load(path)?,
        None => BusConfig::default(),
    };
    if let Some(url) = &cli.broker_url {
        config.broker.url = url.clone();
    }

    let broker = build_broker(&config.broker.url).await?;
    let directory = Arc::new(StaticDirectory::new());
    for (workspace, agents) in &config.workspaces {
        for agent in agents {
            directory.register_agent(workspace, agent).await;
        }
    }

    let bus = Bus::start(
        &config,
        broker,
        Arc::clone(&directory) as Arc<dyn WorkspaceDirectory>,
    );

    println!(
        "{} listening on {} (broker: {})",
        style("hive-server").green().bold(),
        style(&cli.addr).cyan(),
        config.broker.url
    );

    tokio::select! {
        result = bus.serve(&cli.addr) => {
            if let Err(err) = result {
                error!("server error: {}", err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    bus.shutdown().await;
    Ok(())
}

async fn build_broker(url: &str) -> anyhow::Result<Arc<dyn Broker>> {
    if url.is_empty() || url.starts_with("memory://") {
        return Ok(Arc::new(MemoryBroker::new()));
    }
    #[cfg(feature = "redis-broker")]
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let broker = hive_core::broker::RedisBroker::connect(url).await?;
        return Ok(Arc::new(broker));
    }
    anyhow::bail!("unsupported broker url: {}", url)
}
