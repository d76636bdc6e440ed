//! Interfaces to the collaborators living outside the cluster core.
//!
//! The cluster never reaches into the rest of the server directly. It asks
//! questions through these traits and reports what happened through
//! [`EventSink`]. In-memory implementations are provided for tests and for
//! running a standalone node.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Result;
use crate::state::AuthStrategy;

/// Atomic key-value store shared by every node (locks, ID cards).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value` only if `key` is absent. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Overwrite `value` only if `key` is present. Returns whether it was stored.
    async fn set_if_present(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Current value of `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove `key` only if it still holds `value`, atomically.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;

    /// Every live key starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Filter registration handed to the realtime matching engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomFilter {
    /// Room identifier (the normalized filter id).
    pub room_id: String,
    /// Index the room listens to.
    pub index: String,
    /// Collection the room listens to.
    pub collection: String,
    /// Normalized filter definition, JSON-encoded.
    pub filters: String,
}

/// The realtime matching engine.
pub trait RealtimeEngine: Send + Sync {
    /// Whether a room with this id is registered.
    fn has(&self, room_id: &str) -> bool;

    /// Register a room's filter.
    fn store(&self, room: &RoomFilter) -> Result<()>;

    /// Deregister a room's filter.
    fn remove(&self, room_id: &str);
}

/// Registry of authentication strategies exposed by plugins.
#[async_trait]
pub trait StrategyRegistry: Send + Sync {
    /// Instantiate and register a strategy.
    async fn register(&self, strategy: &AuthStrategy) -> Result<()>;

    /// Remove a strategy.
    async fn unregister(&self, plugin_name: &str, strategy_name: &str) -> Result<()>;
}

/// Whether an index cache change is visible to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexScope {
    /// User-facing storage.
    Public,
    /// Internal storage.
    Private,
}

/// Availability of the node as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    /// Enough nodes are active; requests are served.
    Ready,
    /// Fewer active nodes than configured; requests must be rejected.
    NotEnoughNodes,
}

/// Fire-and-forget notifications for the local server.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    /// Document notification to dispatch to local subscribers of `rooms`.
    DocumentNotification {
        /// Target rooms.
        rooms: Vec<String>,
        /// JSON-encoded notification.
        notification: String,
    },
    /// User (join/leave) notification for one room.
    UserNotification {
        /// Target room.
        room: String,
        /// JSON-encoded notification.
        notification: String,
    },
    /// Custom event broadcast by another node.
    ClusterEvent {
        /// Event name.
        event: String,
        /// JSON-encoded payload.
        payload: String,
    },
    /// A security profile changed.
    ProfileInvalidated {
        /// Profile identifier.
        profile_id: String,
    },
    /// A security role changed.
    RoleInvalidated {
        /// Role identifier.
        role_id: String,
    },
    /// Every security object was reset.
    SecurityReset,
    /// Document validators changed.
    ValidatorsRefresh,
    /// An index was created.
    IndexAdded {
        /// Index name.
        index: String,
        /// Storage scope.
        scope: IndexScope,
    },
    /// A collection was created.
    CollectionAdded {
        /// Index name.
        index: String,
        /// Collection name.
        collection: String,
        /// Storage scope.
        scope: IndexScope,
    },
    /// Indexes were deleted.
    IndexesRemoved {
        /// Index names.
        indexes: Vec<String>,
        /// Storage scope.
        scope: IndexScope,
    },
    /// A collection was deleted.
    CollectionRemoved {
        /// Index name.
        index: String,
        /// Collection name.
        collection: String,
        /// Storage scope.
        scope: IndexScope,
    },
    /// A diagnostic dump was requested.
    DumpRequested {
        /// Dump name suffix.
        suffix: String,
    },
    /// A cluster-wide shutdown was requested.
    ShutdownRequested,
    /// The node switched availability.
    Health(NodeHealth),
    /// The node left the cluster; the process must terminate.
    Terminated {
        /// Why the node stopped.
        reason: String,
    },
}

/// Receiver of [`LocalEvent`]s.
pub trait EventSink: Send + Sync {
    /// Deliver an event. Must not block.
    fn emit(&self, event: LocalEvent);
}

// ============================================================================
// In-memory collaborators
// ============================================================================

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// [`KvStore`] kept in process memory, with TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, KvEntry>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_live() => Ok(false),
            Entry::Occupied(mut entry) => {
                entry.insert(KvEntry::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(KvEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn set_if_present(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live() => {
                *entry = KvEntry::new(value, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, entry)| entry.is_live()))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, entry| entry.is_live() && entry.value == value)
            .is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// [`RealtimeEngine`] that only records registered rooms.
#[derive(Debug, Default)]
pub struct MemoryRealtime {
    rooms: Mutex<HashMap<String, RoomFilter>>,
}

impl MemoryRealtime {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered room ids, sorted.
    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.rooms).keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl RealtimeEngine for MemoryRealtime {
    fn has(&self, room_id: &str) -> bool {
        lock(&self.rooms).contains_key(room_id)
    }

    fn store(&self, room: &RoomFilter) -> Result<()> {
        lock(&self.rooms).insert(room.room_id.clone(), room.clone());
        Ok(())
    }

    fn remove(&self, room_id: &str) {
        lock(&self.rooms).remove(room_id);
    }
}

/// [`StrategyRegistry`] that only records registered strategies.
#[derive(Debug, Default)]
pub struct MemoryStrategies {
    strategies: Mutex<HashMap<String, AuthStrategy>>,
}

impl MemoryStrategies {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered strategy names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.strategies).keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl StrategyRegistry for MemoryStrategies {
    async fn register(&self, strategy: &AuthStrategy) -> Result<()> {
        lock(&self.strategies).insert(strategy.strategy_name.clone(), strategy.clone());
        Ok(())
    }

    async fn unregister(&self, _plugin_name: &str, strategy_name: &str) -> Result<()> {
        lock(&self.strategies).remove(strategy_name);
        Ok(())
    }
}

/// [`EventSink`] keeping every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<LocalEvent>>,
}

impl RecordingEvents {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    pub fn events(&self) -> Vec<LocalEvent> {
        lock(&self.events).clone()
    }

    /// Whether an event equal to `event` was received.
    pub fn contains(&self, event: &LocalEvent) -> bool {
        lock(&self.events).iter().any(|e| e == event)
    }
}

impl EventSink for RecordingEvents {
    fn emit(&self, event: LocalEvent) {
        lock(&self.events).push(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
