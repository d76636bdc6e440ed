//! Wire messages exchanged between nodes.
//!
//! Sync messages travel over the broadcast socket, one topic per message
//! kind; each payload is a bincode-encoded [`Stamped`] carrying the
//! publisher's sequence number. Command messages travel over the
//! request/reply socket.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::activity::ActivityEntry;
use crate::bus::{IndexScope, RoomFilter};
use crate::error::{ClusterError, Result};
use crate::state::{AuthStrategy, FullState};

/// Full state request topic.
pub const TOPIC_FULLSTATE: &str = "fullstate";
/// Handshake request topic.
pub const TOPIC_HANDSHAKE: &str = "handshake";

/// Messages replicated from one node to every other node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// The sender created a realtime room.
    NewRealtimeRoom {
        /// Room filter registration.
        room: RoomFilter,
    },
    /// The sender no longer has subscribers on a room.
    RemoveRealtimeRoom {
        /// Room identifier.
        room_id: String,
    },
    /// The sender gained a subscriber on a room.
    Subscription {
        /// Room identifier.
        room_id: String,
    },
    /// The sender lost a subscriber on a room.
    Unsubscription {
        /// Room identifier.
        room_id: String,
    },
    /// Document notification to dispatch to local subscribers.
    DocumentNotification {
        /// Target rooms.
        rooms: Vec<String>,
        /// JSON-encoded notification.
        notification: String,
    },
    /// User notification to dispatch to local subscribers.
    UserNotification {
        /// Target room.
        room: String,
        /// JSON-encoded notification.
        notification: String,
    },
    /// Custom cluster-wide event.
    ClusterWideEvent {
        /// Event name.
        event: String,
        /// JSON-encoded payload.
        payload: String,
    },
    /// A plugin registered an authentication strategy.
    NewAuthStrategy {
        /// The strategy.
        strategy: AuthStrategy,
    },
    /// A plugin removed an authentication strategy.
    RemoveAuthStrategy {
        /// Plugin name.
        plugin_name: String,
        /// Strategy name.
        strategy_name: String,
    },
    /// The sender evicted a node.
    NodeEvicted {
        /// Node that took the decision.
        evictor: String,
        /// Evicted node.
        node_id: String,
        /// Why.
        reason: String,
    },
    /// The sender is leaving the cluster.
    NodeShutdown {
        /// Leaving node.
        node_id: String,
    },
    /// Liveness signal.
    Heartbeat {
        /// Sender address.
        address: String,
    },
    /// An index was created.
    AddIndex {
        /// Index name.
        index: String,
        /// Storage scope.
        scope: IndexScope,
    },
    /// A collection was created.
    AddCollection {
        /// Index name.
        index: String,
        /// Collection name.
        collection: String,
        /// Storage scope.
        scope: IndexScope,
    },
    /// Indexes were deleted.
    RemoveIndexes {
        /// Index names.
        indexes: Vec<String>,
        /// Storage scope.
        scope: IndexScope,
    },
    /// A collection was deleted.
    RemoveCollection {
        /// Index name.
        index: String,
        /// Collection name.
        collection: String,
        /// Storage scope.
        scope: IndexScope,
    },
    /// A security profile changed.
    InvalidateProfile {
        /// Profile identifier.
        profile_id: String,
    },
    /// A security role changed.
    InvalidateRole {
        /// Role identifier.
        role_id: String,
    },
    /// Every security object was reset.
    ResetSecurity,
    /// Document validators changed.
    RefreshValidators,
    /// Every node must write a diagnostic dump.
    DumpRequest {
        /// Dump name suffix.
        suffix: String,
    },
    /// Every node must shut down.
    Shutdown,
    /// Suspend or resume heartbeat-based eviction of the sender.
    DebugPreventEviction {
        /// Whether the sender may be evicted.
        evictable: bool,
    },
}

const SYNC_TOPICS: &[&str] = &[
    "NewRealtimeRoom",
    "RemoveRealtimeRoom",
    "Subscription",
    "Unsubscription",
    "DocumentNotification",
    "UserNotification",
    "ClusterWideEvent",
    "NewAuthStrategy",
    "RemoveAuthStrategy",
    "NodeEvicted",
    "NodeShutdown",
    "Heartbeat",
    "AddIndex",
    "AddCollection",
    "RemoveIndexes",
    "RemoveCollection",
    "InvalidateProfile",
    "InvalidateRole",
    "ResetSecurity",
    "RefreshValidators",
    "DumpRequest",
    "Shutdown",
    "DebugPreventEviction",
];

impl SyncMessage {
    /// Topic the message is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            SyncMessage::NewRealtimeRoom { .. } => "NewRealtimeRoom",
            SyncMessage::RemoveRealtimeRoom { .. } => "RemoveRealtimeRoom",
            SyncMessage::Subscription { .. } => "Subscription",
            SyncMessage::Unsubscription { .. } => "Unsubscription",
            SyncMessage::DocumentNotification { .. } => "DocumentNotification",
            SyncMessage::UserNotification { .. } => "UserNotification",
            SyncMessage::ClusterWideEvent { .. } => "ClusterWideEvent",
            SyncMessage::NewAuthStrategy { .. } => "NewAuthStrategy",
            SyncMessage::RemoveAuthStrategy { .. } => "RemoveAuthStrategy",
            SyncMessage::NodeEvicted { .. } => "NodeEvicted",
            SyncMessage::NodeShutdown { .. } => "NodeShutdown",
            SyncMessage::Heartbeat { .. } => "Heartbeat",
            SyncMessage::AddIndex { .. } => "AddIndex",
            SyncMessage::AddCollection { .. } => "AddCollection",
            SyncMessage::RemoveIndexes { .. } => "RemoveIndexes",
            SyncMessage::RemoveCollection { .. } => "RemoveCollection",
            SyncMessage::InvalidateProfile { .. } => "InvalidateProfile",
            SyncMessage::InvalidateRole { .. } => "InvalidateRole",
            SyncMessage::ResetSecurity => "ResetSecurity",
            SyncMessage::RefreshValidators => "RefreshValidators",
            SyncMessage::DumpRequest { .. } => "DumpRequest",
            SyncMessage::Shutdown => "Shutdown",
            SyncMessage::DebugPreventEviction { .. } => "DebugPreventEviction",
        }
    }

    /// Encode with the sequence number assigned by the publisher.
    pub fn encode(&self, message_id: u64) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&Stamped {
            message_id: Some(message_id),
            message: self.clone(),
        })?)
    }
}

/// Payload of a sync frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped {
    /// Publisher sequence number; always set by well-behaved publishers.
    pub message_id: Option<u64>,
    /// The message.
    pub message: SyncMessage,
}

/// Decode a sync frame received from `from`.
///
/// Unknown topics, undecodable payloads, payloads that do not match their
/// topic and payloads without a sequence number are protocol violations.
pub fn decode_sync(from: &str, topic: &str, payload: &[u8]) -> Result<(u64, SyncMessage)> {
    let violation = |msg: String| ClusterError::ProtocolViolation {
        node_id: from.to_string(),
        msg,
    };

    if !SYNC_TOPICS.contains(&topic) {
        return Err(violation(format!("unknown topic {}", topic)));
    }
    let stamped: Stamped = bincode::deserialize(payload)
        .map_err(|e| violation(format!("malformed {} message: {}", topic, e)))?;
    if stamped.message.topic() != topic {
        return Err(violation(format!(
            "{} message published under topic {}",
            stamped.message.topic(),
            topic
        )));
    }
    let message_id = stamped
        .message_id
        .ok_or_else(|| violation(format!("{} message without a message id", topic)))?;
    Ok((message_id, stamped.message))
}

/// Last message id published by a node, as reported in a full state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node identifier.
    pub node_id: String,
    /// Last message id published by that node.
    pub last_message_id: u64,
}

/// Reply to a full state request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullStateResponse {
    /// The answering node and every remote node it follows.
    pub nodes: Vec<NodeStatus>,
    /// Replicated state snapshot.
    pub state: FullState,
    /// Activity log of the answering node.
    pub activity: Vec<ActivityEntry>,
}

impl FullStateResponse {
    /// Last message id of `node_id` as known by the answering node.
    pub fn last_message_id(&self, node_id: &str) -> Option<u64> {
        self.nodes
            .iter()
            .find(|node| node.node_id == node_id)
            .map(|node| node.last_message_id)
    }
}

/// A joining node introducing itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Joining node.
    pub node_id: String,
    /// Its address.
    pub ip: String,
    /// Last message id it published.
    pub last_message_id: u64,
}

/// Answer to a [`HandshakeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Whether the joining node was accepted.
    pub added: bool,
    /// Last message id published by the answering node.
    pub last_message_id: u64,
}

/// Encode a command message.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(message)?)
}

/// Decode a command message.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(payload)?)
}
