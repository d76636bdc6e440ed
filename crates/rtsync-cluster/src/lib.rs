#![warn(missing_docs)]

//! rtsync cluster subsystem: cluster bootstrap, ordered state replication, failure detection, split-brain arbitration

pub mod activity;
pub mod bus;
pub mod command;
pub mod config;
pub mod consistency;
pub mod context;
pub mod error;
pub mod idcard;
pub mod ip;
pub mod messages;
pub mod mutex;
pub mod node;
pub mod publisher;
pub mod state;
pub mod subscriber;

pub use activity::{ActivityEntry, ActivityEvent, ActivityLog};
pub use bus::{
    EventSink, IndexScope, KvStore, LocalEvent, MemoryKvStore, MemoryRealtime, MemoryStrategies,
    NodeHealth, RealtimeEngine, RecordingEvents, RoomFilter, StrategyRegistry,
};
pub use config::{ClusterConfig, IpFamily, IpPolicy, PortsConfig};
pub use context::ClusterContext;
pub use error::{ClusterError, Result};
pub use idcard::{IdCard, IdCardStore, KvIdCardStore};
pub use messages::SyncMessage;
pub use node::{ClusterStatus, Node, NodeInfo, NodePhase};
pub use state::{AuthStrategy, ClusterState, FullState, RoomListing};
