#![warn(missing_docs)]

//! Standalone cluster node running against in-memory collaborators.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rtsync_cluster::{
    ClusterConfig, ClusterContext, EventSink, LocalEvent, MemoryKvStore, MemoryRealtime,
    MemoryStrategies, Node,
};
use rtsync_transport::TcpNetwork;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rtsync-node", about = "Run one realtime cluster node")]
struct Cli {
    /// Configuration file (TOML or JSON).
    #[arg(short, long, env = "RTSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Override the minimum number of nodes required to serve requests.
    #[arg(long)]
    min_nodes: Option<usize>,
}

/// Forwards local events to the log.
struct LogEvents;

impl EventSink for LogEvents {
    fn emit(&self, event: LocalEvent) {
        tracing::info!(?event, "[CLUSTER] local event");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    let mut config = match &cli.config {
        Some(path) => ClusterConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ClusterConfig::default(),
    };
    if let Some(min_nodes) = cli.min_nodes {
        config.min_nodes = min_nodes;
    }
    config.validate()?;

    let ctx = ClusterContext::new(
        config,
        Arc::new(MemoryKvStore::new()),
        Arc::new(MemoryRealtime::new()),
        Arc::new(MemoryStrategies::new()),
        Arc::new(LogEvents),
        Arc::new(TcpNetwork::default()),
    );
    let node = Node::new(ctx);
    node.init().await.context("node failed to start")?;

    let status = node.status().await?;
    tracing::info!(
        status = %serde_json::to_string(&status)?,
        "[CLUSTER] node running"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[CLUSTER] interrupted");
            node.shutdown("interrupted").await;
        }
        _ = node.terminated() => {}
    }
    node.terminated().await;
    Ok(())
}
