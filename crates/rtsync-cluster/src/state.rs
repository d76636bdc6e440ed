//! Replicated cluster state: realtime rooms and authentication strategies.
//!
//! Each room keeps one [`Contribution`] per node reporting subscribers on it,
//! together with the id of the last sync message accepted from that node for
//! the room. Updates carrying an id that is not strictly greater are replays
//! and are ignored. Any other inconsistency is a desync.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::{RealtimeEngine, RoomFilter, StrategyRegistry};
use crate::error::{ClusterError, Result};

/// Authentication strategy registered by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStrategy {
    /// Strategy name, unique across the cluster.
    pub strategy_name: String,
    /// Plugin exposing the strategy.
    pub plugin_name: String,
    /// JSON-encoded strategy definition.
    pub strategy: String,
}

/// Subscribers reported by one node on one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    /// Number of local subscribers on the contributing node.
    pub subscribers: u64,
    /// Id of the last accepted update from that node.
    pub last_message_id: u64,
}

/// A node joining a room, as carried by a room creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contributor {
    /// Contributing node.
    pub node_id: String,
    /// Id of the message that created the contribution.
    pub message_id: u64,
    /// Initial subscriber count.
    pub subscribers: u64,
}

/// One realtime room and its contributors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomState {
    /// Room filter registration.
    pub filter: RoomFilter,
    /// Per-node subscriber counts.
    pub contributors: BTreeMap<String, Contribution>,
}

impl RoomState {
    /// Total subscribers across the cluster.
    pub fn subscribers(&self) -> u64 {
        self.contributors.values().map(|c| c.subscribers).sum()
    }
}

/// Serializable snapshot of a [`ClusterState`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullState {
    /// Every known room.
    pub rooms: Vec<RoomState>,
    /// Every registered strategy.
    pub strategies: Vec<AuthStrategy>,
}

/// index → collection → room id → subscriber count.
pub type RoomListing = BTreeMap<String, BTreeMap<String, BTreeMap<String, u64>>>;

/// Replicated state owned by a node.
pub struct ClusterState {
    rooms: HashMap<String, RoomState>,
    strategies: BTreeMap<String, AuthStrategy>,
    realtime: Arc<dyn RealtimeEngine>,
}

impl ClusterState {
    /// Create an empty state bound to the local matching engine.
    pub fn new(realtime: Arc<dyn RealtimeEngine>) -> Self {
        Self {
            rooms: HashMap::new(),
            strategies: BTreeMap::new(),
            realtime,
        }
    }

    /// Record a node's contribution to a room, creating the room on first sight.
    pub fn add_room(&mut self, filter: RoomFilter, contributor: Contributor) -> Result<()> {
        let room_id = filter.room_id.clone();
        if !self.rooms.contains_key(&room_id) {
            // the engine may already know the room when it was created locally
            if !self.realtime.has(&room_id) {
                self.realtime.store(&filter)?;
            }
            self.rooms.insert(
                room_id.clone(),
                RoomState {
                    filter,
                    contributors: BTreeMap::new(),
                },
            );
        }

        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| ClusterError::desync(format!("room {} vanished", room_id)))?;
        if room.contributors.contains_key(&contributor.node_id) {
            return Err(ClusterError::desync(format!(
                "node {} already contributes to room {}",
                contributor.node_id, room_id
            )));
        }
        room.contributors.insert(
            contributor.node_id,
            Contribution {
                subscribers: contributor.subscribers,
                last_message_id: contributor.message_id,
            },
        );
        Ok(())
    }

    /// Add one subscriber reported by `node_id`, unless `message_id` was already applied.
    pub fn increment_subscription(
        &mut self,
        room_id: &str,
        node_id: &str,
        message_id: u64,
    ) -> Result<()> {
        let contribution = self.contribution_mut(room_id, node_id)?;
        if message_id > contribution.last_message_id {
            contribution.subscribers += 1;
            contribution.last_message_id = message_id;
        }
        Ok(())
    }

    /// Remove one subscriber reported by `node_id`, unless `message_id` was already applied.
    pub fn decrement_subscription(
        &mut self,
        room_id: &str,
        node_id: &str,
        message_id: u64,
    ) -> Result<()> {
        let contribution = self.contribution_mut(room_id, node_id)?;
        if message_id > contribution.last_message_id {
            if contribution.subscribers == 0 {
                return Err(ClusterError::desync(format!(
                    "negative subscriber count on room {} for node {}",
                    room_id, node_id
                )));
            }
            contribution.subscribers -= 1;
            contribution.last_message_id = message_id;
        }
        Ok(())
    }

    /// A node's contribution to a room.
    pub fn contribution(&self, room_id: &str, node_id: &str) -> Result<&Contribution> {
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| ClusterError::desync(format!("unknown room {}", room_id)))?;
        room.contributors.get(node_id).ok_or_else(|| {
            ClusterError::desync(format!(
                "node {} does not contribute to room {}",
                node_id, room_id
            ))
        })
    }

    fn contribution_mut(&mut self, room_id: &str, node_id: &str) -> Result<&mut Contribution> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| ClusterError::desync(format!("unknown room {}", room_id)))?;
        room.contributors.get_mut(node_id).ok_or_else(|| {
            ClusterError::desync(format!(
                "node {} does not contribute to room {}",
                node_id, room_id
            ))
        })
    }

    /// Drop a node's contribution to a room, deleting the room when nobody is left.
    ///
    /// Unknown rooms are ignored: local-only rooms are torn down without a sync record.
    pub fn remove_room(&mut self, room_id: &str, node_id: &str) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            debug!(room_id, "[CLUSTER] removal of an unknown room ignored");
            return;
        };
        room.contributors.remove(node_id);
        if room.contributors.is_empty() {
            self.rooms.remove(room_id);
            self.realtime.remove(room_id);
        }
    }

    /// Drop every contribution of a node that left the cluster.
    pub fn remove_node(&mut self, node_id: &str) {
        let mut emptied = Vec::new();
        for (room_id, room) in self.rooms.iter_mut() {
            if room.contributors.remove(node_id).is_some() && room.contributors.is_empty() {
                emptied.push(room_id.clone());
            }
        }
        for room_id in emptied {
            self.rooms.remove(&room_id);
            self.realtime.remove(&room_id);
        }
    }

    /// Total subscribers on a room across the cluster; 0 for unknown rooms.
    pub fn count_subscriptions(&self, room_id: &str) -> u64 {
        self.rooms.get(room_id).map_or(0, RoomState::subscribers)
    }

    /// Whether the room is known.
    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Borrow a room.
    pub fn room(&self, room_id: &str) -> Option<&RoomState> {
        self.rooms.get(room_id)
    }

    /// Every room grouped by index and collection, with its subscriber count.
    pub fn list_rooms(&self) -> RoomListing {
        let mut listing = RoomListing::new();
        for (room_id, room) in &self.rooms {
            listing
                .entry(room.filter.index.clone())
                .or_default()
                .entry(room.filter.collection.clone())
                .or_default()
                .insert(room_id.clone(), room.subscribers());
        }
        listing
    }

    /// Register a strategy; re-adding the same name replaces it.
    pub fn add_auth_strategy(&mut self, strategy: AuthStrategy) {
        self.strategies
            .insert(strategy.strategy_name.clone(), strategy);
    }

    /// Forget a strategy. Returns it if it was known.
    pub fn remove_auth_strategy(&mut self, strategy_name: &str) -> Option<AuthStrategy> {
        self.strategies.remove(strategy_name)
    }

    /// Registered strategies, sorted by name.
    pub fn auth_strategies(&self) -> Vec<AuthStrategy> {
        self.strategies.values().cloned().collect()
    }

    /// Snapshot the whole state.
    pub fn serialize(&self) -> FullState {
        let mut rooms: Vec<RoomState> = self.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| a.filter.room_id.cmp(&b.filter.room_id));
        FullState {
            rooms,
            strategies: self.auth_strategies(),
        }
    }

    /// Replace the state with a snapshot, rebuilding every runtime object it implies.
    pub async fn load_full_state(
        &mut self,
        snapshot: FullState,
        registry: &dyn StrategyRegistry,
    ) -> Result<()> {
        for room in snapshot.rooms {
            if !self.realtime.has(&room.filter.room_id) {
                self.realtime.store(&room.filter)?;
            }
            self.rooms.insert(room.filter.room_id.clone(), room);
        }

        for strategy in snapshot.strategies {
            registry.register(&strategy).await?;
            self.strategies
                .insert(strategy.strategy_name.clone(), strategy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryRealtime, MemoryStrategies};
    use proptest::prelude::*;

    fn filter(room_id: &str) -> RoomFilter {
        RoomFilter {
            room_id: room_id.to_string(),
            index: "idx".to_string(),
            collection: "col".to_string(),
            filters: r#"{"equals":{"name":"foo"}}"#.to_string(),
        }
    }

    fn contributor(node_id: &str, message_id: u64) -> Contributor {
        Contributor {
            node_id: node_id.to_string(),
            message_id,
            subscribers: 0,
        }
    }

    fn new_state() -> (ClusterState, Arc<MemoryRealtime>) {
        let realtime = Arc::new(MemoryRealtime::new());
        (ClusterState::new(realtime.clone()), realtime)
    }

    #[test]
    fn test_add_room_registers_filter_once() {
        let (mut state, realtime) = new_state();
        state.add_room(filter("r1"), contributor("a", 1)).unwrap();
        state.add_room(filter("r1"), contributor("b", 4)).unwrap();

        assert_eq!(realtime.room_ids(), vec!["r1"]);
        assert_eq!(state.room("r1").unwrap().contributors.len(), 2);
    }

    #[test]
    fn test_add_room_duplicate_contributor_is_desync() {
        let (mut state, _) = new_state();
        state.add_room(filter("r1"), contributor("a", 1)).unwrap();
        let err = state.add_room(filter("r1"), contributor("a", 2)).unwrap_err();
        assert!(matches!(err, ClusterError::Desync { .. }));
    }

    #[test]
    fn test_increment_is_idempotent_per_message_id() {
        let (mut state, _) = new_state();
        state.add_room(filter("r1"), contributor("a", 1)).unwrap();

        state.increment_subscription("r1", "a", 3).unwrap();
        state.increment_subscription("r1", "a", 3).unwrap();
        assert_eq!(state.count_subscriptions("r1"), 1);

        state.increment_subscription("r1", "a", 2).unwrap();
        assert_eq!(state.count_subscriptions("r1"), 1);

        state.increment_subscription("r1", "a", 4).unwrap();
        assert_eq!(state.count_subscriptions("r1"), 2);
    }

    #[test]
    fn test_decrement_below_zero_is_desync_without_mutation() {
        let (mut state, _) = new_state();
        state.add_room(filter("r1"), contributor("a", 1)).unwrap();

        let err = state.decrement_subscription("r1", "a", 2).unwrap_err();
        assert!(matches!(err, ClusterError::Desync { .. }));
        let room = state.room("r1").unwrap();
        assert_eq!(room.contributors["a"].subscribers, 0);
        assert_eq!(room.contributors["a"].last_message_id, 1);
    }

    #[test]
    fn test_mutation_on_unknown_room_or_node_is_desync() {
        let (mut state, _) = new_state();
        assert!(matches!(
            state.increment_subscription("nope", "a", 1),
            Err(ClusterError::Desync { .. })
        ));
        state.add_room(filter("r1"), contributor("a", 1)).unwrap();
        assert!(matches!(
            state.increment_subscription("r1", "b", 2),
            Err(ClusterError::Desync { .. })
        ));
        assert!(matches!(
            state.decrement_subscription("r1", "b", 2),
            Err(ClusterError::Desync { .. })
        ));
    }

    #[test]
    fn test_contribution_lookup() {
        let (mut state, _) = new_state();
        state.add_room(filter("r1"), contributor("a", 1)).unwrap();
        state.increment_subscription("r1", "a", 2).unwrap();

        let contribution = state.contribution("r1", "a").unwrap();
        assert_eq!(contribution.subscribers, 1);
        assert_eq!(contribution.last_message_id, 2);
        assert!(state.contribution("r1", "b").is_err());
        assert!(state.contribution("r2", "a").is_err());
    }

    #[test]
    fn test_room_lifecycle_returns_to_unknown() {
        let (mut state, realtime) = new_state();
        state.add_room(filter("r1"), contributor("a", 1)).unwrap();
        state.add_room(filter("r1"), contributor("b", 1)).unwrap();
        state.increment_subscription("r1", "a", 2).unwrap();
        state.increment_subscription("r1", "b", 2).unwrap();
        assert_eq!(state.count_subscriptions("r1"), 2);

        state.remove_room("r1", "a");
        assert!(state.has_room("r1"));
        assert_eq!(state.count_subscriptions("r1"), 1);

        state.remove_room("r1", "b");
        assert!(!state.has_room("r1"));
        assert_eq!(state.count_subscriptions("r1"), 0);
        assert!(realtime.room_ids().is_empty());
    }

    #[test]
    fn test_remove_unknown_room_is_noop() {
        let (mut state, _) = new_state();
        state.remove_room("ghost", "a");
        assert_eq!(state.count_subscriptions("ghost"), 0);
    }

    #[test]
    fn test_remove_node_drops_all_contributions() {
        let (mut state, realtime) = new_state();
        state.add_room(filter("r1"), contributor("a", 1)).unwrap();
        state.add_room(filter("r2"), contributor("a", 2)).unwrap();
        state.add_room(filter("r2"), contributor("b", 1)).unwrap();

        state.remove_node("a");
        assert!(!state.has_room("r1"));
        assert!(state.has_room("r2"));
        assert_eq!(realtime.room_ids(), vec!["r2"]);
    }

    #[test]
    fn test_list_rooms_nested() {
        let (mut state, _) = new_state();
        state.add_room(filter("r1"), contributor("a", 1)).unwrap();
        let mut other = filter("r2");
        other.collection = "other".to_string();
        state.add_room(other, contributor("a", 2)).unwrap();
        state.increment_subscription("r1", "a", 3).unwrap();

        let listing = state.list_rooms();
        assert_eq!(listing["idx"]["col"]["r1"], 1);
        assert_eq!(listing["idx"]["other"]["r2"], 0);
    }

    #[test]
    fn test_auth_strategies_set_semantics() {
        let (mut state, _) = new_state();
        let strategy = AuthStrategy {
            strategy_name: "local".to_string(),
            plugin_name: "auth-local".to_string(),
            strategy: "{}".to_string(),
        };
        state.add_auth_strategy(strategy.clone());
        state.add_auth_strategy(strategy.clone());
        assert_eq!(state.auth_strategies(), vec![strategy]);
        assert!(state.remove_auth_strategy("local").is_some());
        assert!(state.remove_auth_strategy("local").is_none());
    }

    #[tokio::test]
    async fn test_load_full_state_rebuilds_runtime_objects() {
        let (mut source, _) = new_state();
        source.add_room(filter("r1"), contributor("a", 1)).unwrap();
        source.increment_subscription("r1", "a", 2).unwrap();
        source.add_auth_strategy(AuthStrategy {
            strategy_name: "oauth".to_string(),
            plugin_name: "auth-oauth".to_string(),
            strategy: "{}".to_string(),
        });
        let snapshot = source.serialize();

        let (mut target, realtime) = new_state();
        let registry = MemoryStrategies::new();
        target
            .load_full_state(snapshot.clone(), &registry)
            .await
            .unwrap();

        assert_eq!(target.serialize(), snapshot);
        assert_eq!(target.count_subscriptions("r1"), 1);
        assert_eq!(realtime.room_ids(), vec!["r1"]);
        assert_eq!(registry.names(), vec!["oauth"]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe(usize),
        Unsubscribe(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize).prop_map(Op::Subscribe),
            (0..3usize).prop_map(Op::Unsubscribe),
        ]
    }

    proptest! {
        #[test]
        fn prop_count_is_sum_and_never_negative(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let nodes = ["a", "b", "c"];
            let (mut state, _) = new_state();
            for node in nodes {
                state.add_room(filter("r"), contributor(node, 0)).unwrap();
            }
            let mut expected = [0u64; 3];
            let mut message_id = 0u64;

            for op in ops {
                message_id += 1;
                match op {
                    Op::Subscribe(n) => {
                        state.increment_subscription("r", nodes[n], message_id).unwrap();
                        expected[n] += 1;
                    }
                    Op::Unsubscribe(n) => {
                        let result = state.decrement_subscription("r", nodes[n], message_id);
                        if expected[n] == 0 {
                            prop_assert!(result.is_err());
                        } else {
                            prop_assert!(result.is_ok());
                            expected[n] -= 1;
                        }
                    }
                }
                prop_assert_eq!(state.count_subscriptions("r"), expected.iter().sum::<u64>());
            }
        }
    }
}
