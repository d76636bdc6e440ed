//! Common fixtures for multi-node integration tests.
//!
//! Every node of a [`TestCluster`] runs in the test process, on its own host
//! of a shared [`MemoryHub`], against a single shared [`MemoryKvStore`].

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rtsync_cluster::{
    ClusterConfig, ClusterContext, ClusterError, EventSink, KvStore, LocalEvent, MemoryKvStore,
    MemoryRealtime, MemoryStrategies, Node, RecordingEvents, RoomFilter,
};
use rtsync_transport::MemoryHub;

/// Heartbeat used by every test node.
pub const HEARTBEAT_MS: u64 = 1000;

/// Test configuration: one-second heartbeat, fast lock polling and short timeouts.
pub fn test_config(ip: &str) -> ClusterConfig {
    let mut config = ClusterConfig {
        heartbeat_ms: HEARTBEAT_MS,
        join_timeout_ms: 20_000,
        command_timeout_ms: 500,
        lock_poll_ms: 50,
        ..ClusterConfig::default()
    };
    config.ip.address = ip.parse().ok();
    config
}

/// One node and the collaborators it reports to.
pub struct TestNode {
    pub ip: String,
    pub node: Arc<Node>,
    pub events: Arc<RecordingEvents>,
    pub realtime: Arc<MemoryRealtime>,
    pub strategies: Arc<MemoryStrategies>,
}

impl TestNode {
    pub fn id(&self) -> String {
        self.node.node_id().unwrap_or_default().to_string()
    }

    pub fn is_terminated(&self) -> bool {
        self.events
            .events()
            .iter()
            .any(|event| matches!(event, LocalEvent::Terminated { .. }))
    }

    pub fn command_addr(&self) -> String {
        format!("{}:{}", self.ip, ClusterConfig::default().ports.command)
    }
}

/// Nodes sharing one in-process network and one key-value store.
pub struct TestCluster {
    pub hub: MemoryHub,
    pub kv: Arc<dyn KvStore>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            hub: MemoryHub::new(),
            kv: Arc::new(MemoryKvStore::new()),
        }
    }

    /// Build a node on `ip` without starting it.
    pub fn node_with(&self, config: ClusterConfig) -> TestNode {
        let ip = config
            .ip
            .address
            .map(|address| address.to_string())
            .unwrap_or_default();
        let events = Arc::new(RecordingEvents::new());
        let realtime = Arc::new(MemoryRealtime::new());
        let strategies = Arc::new(MemoryStrategies::new());
        let sink: Arc<dyn EventSink> = events.clone();
        let ctx = ClusterContext::new(
            config,
            Arc::clone(&self.kv),
            realtime.clone(),
            strategies.clone(),
            sink,
            Arc::new(self.hub.network(&ip)),
        );
        TestNode {
            ip,
            node: Node::new(ctx),
            events,
            realtime,
            strategies,
        }
    }

    /// Start a node and wait until it has joined.
    pub async fn start_with(&self, config: ClusterConfig) -> Result<TestNode, ClusterError> {
        let node = self.node_with(config);
        node.node.init().await?;
        Ok(node)
    }

    pub async fn start(&self, ip: &str) -> TestNode {
        match self.start_with(test_config(ip)).await {
            Ok(node) => node,
            Err(e) => panic!("node {} failed to start: {}", ip, e),
        }
    }

    /// Cut `ip` off from every other host.
    pub fn isolate(&self, ip: &str, others: &[&TestNode]) {
        for other in others {
            self.hub.partition(ip, &other.ip);
        }
    }
}

/// Let background tasks deliver pending messages, well under one heartbeat.
pub async fn settle() {
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(13)).await;
    }
}

/// Advance the paused clock by `n` heartbeats.
pub async fn heartbeats(n: u64) {
    tokio::time::sleep(Duration::from_millis(HEARTBEAT_MS * n)).await;
}

pub fn room(room_id: &str) -> RoomFilter {
    RoomFilter {
        room_id: room_id.to_string(),
        index: "nyc-open-data".to_string(),
        collection: "yellow-taxi".to_string(),
        filters: r#"{"equals":{"city":"NYC"}}"#.to_string(),
    }
}
