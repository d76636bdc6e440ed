//! Dependencies injected into a [`Node`](crate::node::Node).

use std::sync::Arc;

use rtsync_transport::Network;

use crate::bus::{EventSink, KvStore, RealtimeEngine, StrategyRegistry};
use crate::config::ClusterConfig;
use crate::idcard::{IdCardStore, KvIdCardStore};

/// Configuration and collaborators of one node.
#[derive(Clone)]
pub struct ClusterContext {
    /// Cluster settings.
    pub config: ClusterConfig,
    /// Shared key-value store (locks, ID cards).
    pub kv: Arc<dyn KvStore>,
    /// Local realtime matching engine.
    pub realtime: Arc<dyn RealtimeEngine>,
    /// Local authentication strategy registry.
    pub strategies: Arc<dyn StrategyRegistry>,
    /// Local event sink.
    pub events: Arc<dyn EventSink>,
    /// Socket factory.
    pub network: Arc<dyn Network>,
    /// ID card registry.
    pub idcards: Arc<dyn IdCardStore>,
}

impl ClusterContext {
    /// Build a context whose ID cards live in `kv`.
    pub fn new(
        config: ClusterConfig,
        kv: Arc<dyn KvStore>,
        realtime: Arc<dyn RealtimeEngine>,
        strategies: Arc<dyn StrategyRegistry>,
        events: Arc<dyn EventSink>,
        network: Arc<dyn Network>,
    ) -> Self {
        let idcards = Arc::new(KvIdCardStore::new(Arc::clone(&kv), config.idcard_ttl()));
        Self {
            config,
            kv,
            realtime,
            strategies,
            events,
            network,
            idcards,
        }
    }

    /// Replace the ID card registry.
    pub fn with_idcards(mut self, idcards: Arc<dyn IdCardStore>) -> Self {
        self.idcards = idcards;
        self
    }
}
