//! Cluster node: bootstrap, replication of local changes, eviction and
//! split-brain handling.
//!
//! A node joins under the `clusterInit` lock: it publishes its ID card,
//! subscribes to every peer found in the store, loads the full state of one
//! of them and handshakes with all of them. Afterwards every local change is
//! published once and applied once locally, and every message received from
//! a peer is applied to the same [`ClusterState`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityEntry, ActivityEvent, ActivityLog};
use crate::bus::{IndexScope, LocalEvent, NodeHealth, RoomFilter};
use crate::command::{CommandClient, CommandHandler, CommandServer};
use crate::consistency::find_condemned;
use crate::context::ClusterContext;
use crate::error::{ClusterError, Result};
use crate::idcard::IdCard;
use crate::ip::{endpoint, select_address};
use crate::messages::{
    FullStateResponse, HandshakeRequest, HandshakeResponse, NodeStatus, SyncMessage,
};
use crate::mutex::{self, LockWait};
use crate::publisher::Publisher;
use crate::state::{AuthStrategy, ClusterState, Contributor, RoomListing};
use crate::subscriber::{Subscriber, SubscriberState, SyncHandler};

const INIT_LOCK: &str = "clusterInit";

/// Lifecycle of a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodePhase {
    /// Created, sockets not bound yet.
    Init,
    /// Looking for peers.
    Discovering,
    /// Loading the full state and handshaking with peers.
    Synchronizing,
    /// Part of the cluster.
    Running,
    /// Leaving the cluster.
    ShuttingDown,
}

/// A cluster member as listed by [`Node::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// Node identifier.
    pub id: String,
    /// Node address.
    pub ip: String,
    /// When the node joined.
    pub birthdate: DateTime<Utc>,
}

/// Snapshot of the cluster as seen by one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStatus {
    /// Local node identifier.
    pub node_id: String,
    /// Local node phase.
    pub phase: NodePhase,
    /// Number of nodes, the local one included.
    pub active_nodes: usize,
    /// Every node, the local one first.
    pub nodes: Vec<NodeInfo>,
    /// Recent membership changes.
    pub activity: Vec<ActivityEntry>,
}

struct Remote {
    ip: String,
    subscriber: Arc<Subscriber>,
}

/// Replicated state together with the last message applied from each remote node.
struct Core {
    state: ClusterState,
    applied: HashMap<String, u64>,
}

enum Followup {
    Evicted {
        evictor: String,
        node_id: String,
        reason: String,
    },
    Left(String),
    Shutdown,
}

/// One member of the cluster.
pub struct Node {
    ctx: ClusterContext,
    me: Weak<Node>,
    client: CommandClient,
    node_id: OnceLock<String>,
    ip: OnceLock<String>,
    publisher: OnceLock<Publisher>,
    command: OnceLock<CommandServer>,
    core: tokio::sync::Mutex<Core>,
    remotes: Mutex<HashMap<String, Remote>>,
    activity: Mutex<ActivityLog>,
    phase: Mutex<NodePhase>,
    health: Mutex<Option<NodeHealth>>,
    announced: AtomicBool,
    evictable: AtomicBool,
    shutting_down: AtomicBool,
    consistency_running: AtomicBool,
    cancel: CancellationToken,
    terminated: CancellationToken,
}

fn guard<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Node {
    /// Create a node. Nothing is bound until [`init`](Self::init).
    pub fn new(ctx: ClusterContext) -> Arc<Self> {
        let config = &ctx.config;
        let client = CommandClient::new(
            ctx.network.requester(),
            config.ports.command,
            config.command_timeout(),
            config.handshake_timeout(),
        );
        let state = ClusterState::new(Arc::clone(&ctx.realtime));
        let activity = ActivityLog::new(config.activity_depth);

        Arc::new_cyclic(|me| Self {
            ctx,
            me: me.clone(),
            client,
            node_id: OnceLock::new(),
            ip: OnceLock::new(),
            publisher: OnceLock::new(),
            command: OnceLock::new(),
            core: tokio::sync::Mutex::new(Core {
                state,
                applied: HashMap::new(),
            }),
            remotes: Mutex::new(HashMap::new()),
            activity: Mutex::new(activity),
            phase: Mutex::new(NodePhase::Init),
            health: Mutex::new(None),
            announced: AtomicBool::new(false),
            evictable: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            consistency_running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            terminated: CancellationToken::new(),
        })
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    /// Bind the sockets, join the cluster and wait until enough nodes are active.
    ///
    /// On failure the node is shut down before the error is returned.
    pub async fn init(&self) -> Result<()> {
        let result = self.start().await;
        if let Err(e) = &result {
            error!(error = %e, "[CLUSTER] unable to join the cluster");
            self.shutdown(&format!("unable to join the cluster: {}", e))
                .await;
        }
        result
    }

    async fn start(&self) -> Result<()> {
        let config = &self.ctx.config;
        let ip = select_address(&config.ip).await?.to_string();
        let _ = self.ip.set(ip.clone());

        let sink = self
            .ctx
            .network
            .bind_publisher(&endpoint(&ip, config.ports.sync))
            .await?;
        let _ = self.publisher.set(Publisher::new(sink));

        let handler: Weak<dyn CommandHandler> = self.me.clone();
        let command = CommandServer::bind(
            self.ctx.network.as_ref(),
            &endpoint(&ip, config.ports.command),
            handler,
        )
        .await?;
        let _ = self.command.set(command);

        match tokio::time::timeout(config.join_timeout(), self.handshake()).await {
            Ok(joined) => joined?,
            Err(_) => {
                return Err(ClusterError::Timeout {
                    what: "cluster join".to_string(),
                    timeout_ms: config.join_timeout_ms,
                })
            }
        }

        self.set_phase(NodePhase::Running);
        self.announced.store(true, Ordering::SeqCst);
        self.wait_for_min_nodes().await?;
        info!(
            node_id = %self.id(),
            ip = %ip,
            nodes = self.count_active_nodes(),
            "[CLUSTER] node ready"
        );
        Ok(())
    }

    /// Join the cluster under the initialization lock.
    pub async fn handshake(&self) -> Result<()> {
        let config = &self.ctx.config;
        let mut lock = mutex::Mutex::new(Arc::clone(&self.ctx.kv), INIT_LOCK, config.lock_poll());
        lock.lock(config.join_timeout(), LockWait::Forever).await?;

        let joined = self.join().await;
        if let Err(e) = lock.unlock().await {
            warn!(error = %e, "[CLUSTER] failed to release the initialization lock");
        }
        joined?;

        self.record_activity(self.id(), self.address(), ActivityEvent::Joined, None);
        Ok(())
    }

    async fn join(&self) -> Result<()> {
        self.set_phase(NodePhase::Discovering);
        let ip = self.address().to_string();
        let card = self.ctx.idcards.create(&ip).await?;
        let _ = self.node_id.set(card.id.clone());
        info!(node_id = %card.id, ip = %ip, "[CLUSTER] ID card published");
        self.start_heartbeat();

        let mut retried = false;
        loop {
            let peers = self.ctx.idcards.remote_cards().await?;
            if peers.is_empty() {
                info!(node_id = %card.id, "[CLUSTER] no other node found, starting a new cluster");
                return Ok(());
            }
            if let Some(twin) = peers.iter().find(|peer| peer.ip == ip) {
                return Err(ClusterError::Config {
                    msg: format!("node {} already uses address {}", twin.id, ip),
                });
            }

            for peer in &peers {
                self.subscribe_to(peer).await?;
            }

            match self.client.get_full_state(&peers).await {
                Some(full) => return self.synchronize(&peers, full).await,
                None => {
                    for peer in &peers {
                        self.forget_remote(&peer.id);
                    }
                    if retried {
                        return Err(ClusterError::NoPeerAnswer {
                            what: "full state".to_string(),
                        });
                    }
                    warn!("[CLUSTER] no node answered the full state request, retrying");
                    retried = true;
                    tokio::time::sleep(self.ctx.config.heartbeat()).await;
                }
            }
        }
    }

    async fn synchronize(&self, peers: &[IdCard], full: FullStateResponse) -> Result<()> {
        self.set_phase(NodePhase::Synchronizing);
        {
            let mut core = self.core.lock().await;
            core.state
                .load_full_state(full.state.clone(), self.ctx.strategies.as_ref())
                .await?;
        }
        if !full.activity.is_empty() {
            guard(&self.activity).adopt(full.activity.clone());
        }

        let request = HandshakeRequest {
            node_id: self.id().to_string(),
            ip: self.address().to_string(),
            last_message_id: self.publisher()?.last_message_id(),
        };
        let responses = self.client.broadcast_handshake(peers, &request).await?;

        for peer in peers {
            let response = responses.get(&peer.id).cloned().flatten();
            let subscriber = self.remote_subscriber(&peer.id);
            match (response, subscriber) {
                (Some(response), Some(subscriber)) if response.added => {
                    let start = full
                        .last_message_id(&peer.id)
                        .unwrap_or(response.last_message_id);
                    self.core.lock().await.applied.insert(peer.id.clone(), start);
                    subscriber.sync(start).await?;
                    self.ctx.idcards.add_node(&peer.id).await?;
                    debug!(remote = %peer.id, start, "[CLUSTER] synchronized with node");
                }
                _ => {
                    warn!(remote = %peer.id, "[CLUSTER] node did not answer the handshake, ignoring it");
                    self.forget_remote(&peer.id);
                }
            }
        }
        Ok(())
    }

    async fn wait_for_min_nodes(&self) -> Result<()> {
        let min_nodes = self.ctx.config.min_nodes;
        if self.count_active_nodes() < min_nodes {
            warn!(
                active = self.count_active_nodes(),
                min_nodes, "[CLUSTER] not enough nodes, waiting for more to join"
            );
            self.set_health(NodeHealth::NotEnoughNodes);
            while self.count_active_nodes() < min_nodes {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(ClusterError::ShuttingDown),
                    _ = tokio::time::sleep(self.ctx.config.heartbeat()) => {}
                }
            }
        }
        self.set_health(NodeHealth::Ready);
        Ok(())
    }

    fn start_heartbeat(&self) {
        let me = self.me.clone();
        let cancel = self.cancel.clone();
        let period = self.ctx.config.heartbeat();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(node) = me.upgrade() else {
                    return;
                };
                if node.announced.load(Ordering::SeqCst) {
                    if let Ok(publisher) = node.publisher() {
                        publisher.send(&SyncMessage::Heartbeat {
                            address: node.address().to_string(),
                        });
                    }
                }
                match node.ctx.idcards.refresh().await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        node.evict_self(&format!("ID card refresh failed: {}", e)).await;
                        return;
                    }
                    Err(e) => warn!(error = %e, "[CLUSTER] ID card refresh failed, retrying"),
                }
            }
        });
    }

    async fn subscribe_to(&self, peer: &IdCard) -> Result<Arc<Subscriber>> {
        let handler: Weak<dyn SyncHandler> = self.me.clone();
        let subscriber = Arc::new(
            Subscriber::connect(
                self.ctx.network.as_ref(),
                &peer.id,
                &peer.ip,
                self.ctx.config.ports.sync,
                self.ctx.config.heartbeat_check_interval(),
                handler,
            )
            .await?,
        );
        let previous = guard(&self.remotes).insert(
            peer.id.clone(),
            Remote {
                ip: peer.ip.clone(),
                subscriber: Arc::clone(&subscriber),
            },
        );
        if let Some(previous) = previous {
            previous.subscriber.dispose();
        }
        Ok(subscriber)
    }

    fn remote_subscriber(&self, node_id: &str) -> Option<Arc<Subscriber>> {
        guard(&self.remotes)
            .get(node_id)
            .map(|remote| Arc::clone(&remote.subscriber))
    }

    fn forget_remote(&self, node_id: &str) -> Option<Remote> {
        let remote = guard(&self.remotes).remove(node_id);
        if let Some(remote) = &remote {
            remote.subscriber.dispose();
        }
        remote
    }

    // ========================================================================
    // Membership
    // ========================================================================

    async fn register_node(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
        if self.is_shutting_down() {
            return Err(ClusterError::ShuttingDown);
        }
        let publisher = self.publisher()?;
        if self.remote_subscriber(&request.node_id).is_some() {
            warn!(remote = %request.node_id, "[CLUSTER] handshake from an already known node");
            return Ok(HandshakeResponse {
                added: false,
                last_message_id: publisher.last_message_id(),
            });
        }

        if let Err(e) = self.attach(&request).await {
            warn!(remote = %request.node_id, error = %e, "[CLUSTER] failed to register joining node");
            self.detach(&request.node_id).await;
            return Err(e);
        }

        self.record_activity(&request.node_id, &request.ip, ActivityEvent::Joined, None);
        info!(remote = %request.node_id, ip = %request.ip, "[CLUSTER] node joined");
        if self.count_active_nodes() >= self.ctx.config.min_nodes
            && self.phase() == NodePhase::Running
        {
            self.set_health(NodeHealth::Ready);
        }

        Ok(HandshakeResponse {
            added: true,
            last_message_id: publisher.last_message_id(),
        })
    }

    async fn attach(&self, request: &HandshakeRequest) -> Result<()> {
        let card = IdCard::new(request.node_id.clone(), request.ip.clone());
        let subscriber = self.subscribe_to(&card).await?;
        self.core
            .lock()
            .await
            .applied
            .insert(request.node_id.clone(), request.last_message_id);
        subscriber.sync(request.last_message_id).await?;
        self.ctx.idcards.add_node(&request.node_id).await
    }

    /// Undo a partial [`attach`](Self::attach).
    async fn detach(&self, node_id: &str) {
        self.forget_remote(node_id);
        let mut core = self.core.lock().await;
        core.state.remove_node(node_id);
        core.applied.remove(node_id);
    }

    async fn snapshot(&self) -> Result<FullStateResponse> {
        if self.is_shutting_down() {
            return Err(ClusterError::ShuttingDown);
        }
        let core = self.core.lock().await;
        let mut nodes = vec![NodeStatus {
            node_id: self.id().to_string(),
            last_message_id: self.publisher()?.last_message_id(),
        }];
        let remote_ids: Vec<String> = guard(&self.remotes).keys().cloned().collect();
        for node_id in remote_ids {
            if let Some(&last_message_id) = core.applied.get(&node_id) {
                nodes.push(NodeStatus {
                    node_id,
                    last_message_id,
                });
            }
        }
        Ok(FullStateResponse {
            nodes,
            state: core.state.serialize(),
            activity: guard(&self.activity).entries(),
        })
    }

    /// Remove a remote node from the cluster. Unknown nodes are ignored.
    ///
    /// A split-brain check runs in the background afterwards.
    pub async fn evict_node(&self, node_id: &str, broadcast: bool, reason: &str) {
        let Some(remote) = self.forget_remote(node_id) else {
            debug!(remote = node_id, "[CLUSTER] eviction of an unknown node ignored");
            return;
        };
        warn!(remote = node_id, reason, broadcast, "[CLUSTER] evicting node");

        if let Err(e) = self.ctx.idcards.remove_node(node_id).await {
            warn!(remote = node_id, error = %e, "[CLUSTER] failed to update topology");
        }
        {
            let mut core = self.core.lock().await;
            core.state.remove_node(node_id);
            core.applied.remove(node_id);
        }
        self.record_activity(node_id, &remote.ip, ActivityEvent::Evicted, Some(reason));

        if let Ok(publisher) = self.publisher() {
            if broadcast {
                publisher.send(&SyncMessage::NodeEvicted {
                    evictor: self.id().to_string(),
                    node_id: node_id.to_string(),
                    reason: reason.to_string(),
                });
            }
            publisher.disconnect(&remote.ip);
        }

        if self.count_active_nodes() < self.ctx.config.min_nodes {
            warn!(
                active = self.count_active_nodes(),
                min_nodes = self.ctx.config.min_nodes,
                "[CLUSTER] not enough nodes, rejecting requests"
            );
            self.set_health(NodeHealth::NotEnoughNodes);
        }

        self.spawn_consistency_check();
    }

    /// Leave the cluster after announcing this node's own eviction.
    pub async fn evict_self(&self, reason: &str) {
        if self.is_shutting_down() {
            return;
        }
        error!(reason, "[CLUSTER] evicting self");
        if let (Ok(publisher), Some(node_id)) = (self.publisher(), self.node_id()) {
            publisher.send(&SyncMessage::NodeEvicted {
                evictor: node_id.to_string(),
                node_id: node_id.to_string(),
                reason: reason.to_string(),
            });
        }
        self.terminate(reason).await;
    }

    /// Leave the cluster in an orderly fashion.
    pub async fn shutdown(&self, reason: &str) {
        if self.is_shutting_down() {
            return;
        }
        info!(reason, "[CLUSTER] shutting down");
        if let (Ok(publisher), Some(node_id)) = (self.publisher(), self.node_id()) {
            publisher.send(&SyncMessage::NodeShutdown {
                node_id: node_id.to_string(),
            });
        }
        self.terminate(reason).await;
    }

    async fn terminate(&self, reason: &str) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_phase(NodePhase::ShuttingDown);
        self.cancel.cancel();

        if let Some(publisher) = self.publisher.get() {
            publisher.dispose().await;
        }
        let remotes: Vec<Remote> = guard(&self.remotes).drain().map(|(_, r)| r).collect();
        for remote in remotes {
            remote.subscriber.dispose();
        }
        if let Some(command) = self.command.get() {
            command.close().await;
        }
        if let Err(e) = self.ctx.idcards.dispose().await {
            warn!(error = %e, "[CLUSTER] failed to remove own ID card");
        }

        self.ctx.events.emit(LocalEvent::Terminated {
            reason: reason.to_string(),
        });
        self.terminated.cancel();
    }

    // ========================================================================
    // Split-brain
    // ========================================================================

    fn spawn_consistency_check(&self) {
        if self.consistency_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = self.me.clone();
        tokio::spawn(async move {
            let Some(node) = me.upgrade() else {
                return;
            };
            node.enforce_consistency().await;
            node.consistency_running.store(false, Ordering::SeqCst);
        });
    }

    /// Re-run the arbitration until the cluster is consistent or this node is condemned.
    ///
    /// This node only condemns itself on two identical verdicts in a row, and
    /// only while it is not suspecting any remote node: until then the ID-card
    /// topologies may still be converging.
    async fn enforce_consistency(&self) {
        let mut previous: Option<BTreeSet<String>> = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.ctx.config.consistency_delay()) => {}
            }

            let cards = match self.all_cards().await {
                Ok(cards) => cards,
                Err(e) => {
                    self.evict_self(&format!("split-brain check failed: {}", e))
                        .await;
                    return;
                }
            };
            let Some(condemned) = find_condemned(&cards) else {
                debug!(nodes = cards.len(), "[CLUSTER] cluster is consistent");
                return;
            };
            if condemned.contains(self.id()) {
                if previous.as_ref() == Some(&condemned) && !self.suspects_remote() {
                    error!(?condemned, "[CLUSTER] network split detected, this node is in the condemned partition");
                    self.evict_self("network split detected").await;
                    return;
                }
                warn!(?condemned, "[CLUSTER] network split detected, this node may be condemned, checking again");
            } else {
                warn!(?condemned, "[CLUSTER] network split detected, waiting for the condemned partition to leave");
            }
            previous = Some(condemned);
        }
    }

    fn suspects_remote(&self) -> bool {
        guard(&self.remotes)
            .values()
            .any(|remote| remote.subscriber.state() == SubscriberState::MissingHeartbeat)
    }

    async fn all_cards(&self) -> Result<Vec<IdCard>> {
        let own = self.ctx.idcards.card().ok_or_else(|| ClusterError::PartitionSuspected {
            msg: "own ID card is missing".to_string(),
        })?;
        let mut cards = self.ctx.idcards.remote_cards().await?;
        cards.push(own);
        Ok(cards)
    }

    // ========================================================================
    // Local changes
    // ========================================================================

    /// Own id, for operations that publish.
    fn joined_id(&self) -> Result<&str> {
        if self.is_shutting_down() {
            return Err(ClusterError::ShuttingDown);
        }
        self.node_id().ok_or(ClusterError::NotJoined)
    }

    fn broadcast(&self, message: SyncMessage) -> Result<u64> {
        self.joined_id()?;
        Ok(self.publisher()?.send(&message))
    }

    /// A realtime room was created locally.
    pub async fn on_new_room(&self, room: RoomFilter) -> Result<()> {
        let me = self.joined_id()?;
        let mut core = self.core.lock().await;
        if core.state.contribution(&room.room_id, me).is_ok() {
            return Err(ClusterError::desync(format!(
                "room {} already created locally",
                room.room_id
            )));
        }
        let message_id = self.broadcast(SyncMessage::NewRealtimeRoom { room: room.clone() })?;
        core.state.add_room(
            room,
            Contributor {
                node_id: me.to_string(),
                message_id,
                subscribers: 0,
            },
        )
    }

    /// A local client subscribed to a room.
    pub async fn on_subscription_added(&self, room_id: &str) -> Result<()> {
        let me = self.joined_id()?;
        let mut core = self.core.lock().await;
        core.state.contribution(room_id, me)?;
        let message_id = self.broadcast(SyncMessage::Subscription {
            room_id: room_id.to_string(),
        })?;
        core.state.increment_subscription(room_id, me, message_id)
    }

    /// A local client unsubscribed from a room.
    pub async fn on_subscription_removed(&self, room_id: &str) -> Result<()> {
        let me = self.joined_id()?;
        let mut core = self.core.lock().await;
        if core.state.contribution(room_id, me)?.subscribers == 0 {
            return Err(ClusterError::desync(format!(
                "no local subscriber left on room {}",
                room_id
            )));
        }
        let message_id = self.broadcast(SyncMessage::Unsubscription {
            room_id: room_id.to_string(),
        })?;
        core.state.decrement_subscription(room_id, me, message_id)
    }

    /// The last local subscriber of a room left.
    pub async fn on_room_removed(&self, room_id: &str) -> Result<()> {
        let me = self.joined_id()?;
        let mut core = self.core.lock().await;
        self.broadcast(SyncMessage::RemoveRealtimeRoom {
            room_id: room_id.to_string(),
        })?;
        core.state.remove_room(room_id, me);
        Ok(())
    }

    /// Forward a document notification to the subscribers of other nodes.
    pub fn on_document_notification(&self, rooms: Vec<String>, notification: String) -> Result<()> {
        self.broadcast(SyncMessage::DocumentNotification {
            rooms,
            notification,
        })
        .map(drop)
    }

    /// Forward a user notification to the subscribers of other nodes.
    pub fn on_user_notification(&self, room: &str, notification: String) -> Result<()> {
        self.broadcast(SyncMessage::UserNotification {
            room: room.to_string(),
            notification,
        })
        .map(drop)
    }

    /// Broadcast a custom event to every other node.
    pub fn on_cluster_event(&self, event: &str, payload: String) -> Result<()> {
        self.broadcast(SyncMessage::ClusterWideEvent {
            event: event.to_string(),
            payload,
        })
        .map(drop)
    }

    /// A plugin registered an authentication strategy locally.
    pub async fn on_auth_strategy_added(&self, strategy: AuthStrategy) -> Result<()> {
        let mut core = self.core.lock().await;
        self.broadcast(SyncMessage::NewAuthStrategy {
            strategy: strategy.clone(),
        })?;
        core.state.add_auth_strategy(strategy);
        Ok(())
    }

    /// A plugin removed an authentication strategy locally.
    pub async fn on_auth_strategy_removed(&self, plugin_name: &str, strategy_name: &str) -> Result<()> {
        let mut core = self.core.lock().await;
        self.broadcast(SyncMessage::RemoveAuthStrategy {
            plugin_name: plugin_name.to_string(),
            strategy_name: strategy_name.to_string(),
        })?;
        core.state.remove_auth_strategy(strategy_name);
        Ok(())
    }

    /// A security profile changed.
    pub fn on_profile_invalidated(&self, profile_id: &str) -> Result<()> {
        self.broadcast(SyncMessage::InvalidateProfile {
            profile_id: profile_id.to_string(),
        })
        .map(drop)
    }

    /// A security role changed.
    pub fn on_role_invalidated(&self, role_id: &str) -> Result<()> {
        self.broadcast(SyncMessage::InvalidateRole {
            role_id: role_id.to_string(),
        })
        .map(drop)
    }

    /// Every security object was reset.
    pub fn on_security_reset(&self) -> Result<()> {
        self.broadcast(SyncMessage::ResetSecurity).map(drop)
    }

    /// Document validators changed.
    pub fn on_validators_refresh(&self) -> Result<()> {
        self.broadcast(SyncMessage::RefreshValidators).map(drop)
    }

    /// An index was created.
    pub fn on_index_added(&self, index: &str, scope: IndexScope) -> Result<()> {
        self.broadcast(SyncMessage::AddIndex {
            index: index.to_string(),
            scope,
        })
        .map(drop)
    }

    /// A collection was created.
    pub fn on_collection_added(&self, index: &str, collection: &str, scope: IndexScope) -> Result<()> {
        self.broadcast(SyncMessage::AddCollection {
            index: index.to_string(),
            collection: collection.to_string(),
            scope,
        })
        .map(drop)
    }

    /// Indexes were deleted.
    pub fn on_indexes_removed(&self, indexes: Vec<String>, scope: IndexScope) -> Result<()> {
        self.broadcast(SyncMessage::RemoveIndexes { indexes, scope })
            .map(drop)
    }

    /// A collection was deleted.
    pub fn on_collection_removed(&self, index: &str, collection: &str, scope: IndexScope) -> Result<()> {
        self.broadcast(SyncMessage::RemoveCollection {
            index: index.to_string(),
            collection: collection.to_string(),
            scope,
        })
        .map(drop)
    }

    /// Ask every other node for a diagnostic dump.
    pub fn on_dump_requested(&self, suffix: &str) -> Result<()> {
        self.broadcast(SyncMessage::DumpRequest {
            suffix: suffix.to_string(),
        })
        .map(drop)
    }

    /// Stop the whole cluster, this node included.
    pub async fn on_shutdown_requested(&self) -> Result<()> {
        self.broadcast(SyncMessage::Shutdown)?;
        self.shutdown("cluster shutdown requested").await;
        Ok(())
    }

    /// Ask the other nodes to suspend (or resume) heartbeat-based eviction of this node.
    pub fn set_evictable(&self, evictable: bool) -> Result<()> {
        self.broadcast(SyncMessage::DebugPreventEviction { evictable })?;
        self.evictable.store(evictable, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the other nodes may evict this one on missed heartbeats.
    pub fn is_evictable(&self) -> bool {
        self.evictable.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Remote changes
    // ========================================================================

    async fn apply_remote(&self, from: &str, message_id: u64, message: SyncMessage) -> Result<()> {
        let events = &self.ctx.events;
        let mut followup = None;
        {
            let mut core = self.core.lock().await;
            match message {
                SyncMessage::NewRealtimeRoom { room } => core.state.add_room(
                    room,
                    Contributor {
                        node_id: from.to_string(),
                        message_id,
                        subscribers: 0,
                    },
                )?,
                SyncMessage::RemoveRealtimeRoom { room_id } => core.state.remove_room(&room_id, from),
                SyncMessage::Subscription { room_id } => {
                    core.state.increment_subscription(&room_id, from, message_id)?
                }
                SyncMessage::Unsubscription { room_id } => {
                    core.state.decrement_subscription(&room_id, from, message_id)?
                }
                SyncMessage::DocumentNotification {
                    rooms,
                    notification,
                } => events.emit(LocalEvent::DocumentNotification {
                    rooms,
                    notification,
                }),
                SyncMessage::UserNotification { room, notification } => {
                    events.emit(LocalEvent::UserNotification { room, notification })
                }
                SyncMessage::ClusterWideEvent { event, payload } => {
                    events.emit(LocalEvent::ClusterEvent { event, payload })
                }
                SyncMessage::NewAuthStrategy { strategy } => {
                    self.ctx.strategies.register(&strategy).await?;
                    core.state.add_auth_strategy(strategy);
                }
                SyncMessage::RemoveAuthStrategy {
                    plugin_name,
                    strategy_name,
                } => {
                    core.state.remove_auth_strategy(&strategy_name);
                    self.ctx
                        .strategies
                        .unregister(&plugin_name, &strategy_name)
                        .await?;
                }
                SyncMessage::NodeEvicted {
                    evictor,
                    node_id,
                    reason,
                } => {
                    followup = Some(Followup::Evicted {
                        evictor,
                        node_id,
                        reason,
                    })
                }
                SyncMessage::NodeShutdown { node_id } => followup = Some(Followup::Left(node_id)),
                SyncMessage::Heartbeat { .. } => {}
                SyncMessage::AddIndex { index, scope } => {
                    events.emit(LocalEvent::IndexAdded { index, scope })
                }
                SyncMessage::AddCollection {
                    index,
                    collection,
                    scope,
                } => events.emit(LocalEvent::CollectionAdded {
                    index,
                    collection,
                    scope,
                }),
                SyncMessage::RemoveIndexes { indexes, scope } => {
                    events.emit(LocalEvent::IndexesRemoved { indexes, scope })
                }
                SyncMessage::RemoveCollection {
                    index,
                    collection,
                    scope,
                } => events.emit(LocalEvent::CollectionRemoved {
                    index,
                    collection,
                    scope,
                }),
                SyncMessage::InvalidateProfile { profile_id } => {
                    events.emit(LocalEvent::ProfileInvalidated { profile_id })
                }
                SyncMessage::InvalidateRole { role_id } => {
                    events.emit(LocalEvent::RoleInvalidated { role_id })
                }
                SyncMessage::ResetSecurity => events.emit(LocalEvent::SecurityReset),
                SyncMessage::RefreshValidators => events.emit(LocalEvent::ValidatorsRefresh),
                SyncMessage::DumpRequest { suffix } => {
                    events.emit(LocalEvent::DumpRequested { suffix })
                }
                SyncMessage::Shutdown => followup = Some(Followup::Shutdown),
                // toggled by the subscriber itself
                SyncMessage::DebugPreventEviction { .. } => {}
            }
            core.applied.insert(from.to_string(), message_id);
        }

        match followup {
            Some(Followup::Evicted {
                evictor,
                node_id,
                reason,
            }) => {
                if self.node_id() == Some(node_id.as_str()) {
                    self.evict_self(&format!("evicted by {}: {}", evictor, reason))
                        .await;
                } else {
                    self.evict_node(&node_id, false, &reason).await;
                }
            }
            Some(Followup::Left(node_id)) => {
                self.evict_node(&node_id, false, "node shutdown").await;
            }
            Some(Followup::Shutdown) => {
                events.emit(LocalEvent::ShutdownRequested);
                self.shutdown("cluster shutdown requested").await;
            }
            None => {}
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Local node identifier, once the ID card is published.
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.get().map(String::as_str)
    }

    fn id(&self) -> &str {
        self.node_id().unwrap_or_default()
    }

    fn address(&self) -> &str {
        self.ip.get().map(String::as_str).unwrap_or_default()
    }

    fn publisher(&self) -> Result<&Publisher> {
        self.publisher.get().ok_or(ClusterError::ShuttingDown)
    }

    /// Current phase.
    pub fn phase(&self) -> NodePhase {
        *guard(&self.phase)
    }

    fn set_phase(&self, phase: NodePhase) {
        let mut current = guard(&self.phase);
        if *current != phase {
            debug!(from = ?*current, to = ?phase, "[CLUSTER] phase change");
            *current = phase;
        }
    }

    /// Latest availability announced to the local server.
    pub fn health(&self) -> Option<NodeHealth> {
        *guard(&self.health)
    }

    fn set_health(&self, health: NodeHealth) {
        let mut current = guard(&self.health);
        if *current != Some(health) {
            *current = Some(health);
            self.ctx.events.emit(LocalEvent::Health(health));
        }
    }

    /// Whether the node is leaving the cluster.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Nodes in the cluster, this one included.
    pub fn count_active_nodes(&self) -> usize {
        guard(&self.remotes).len() + 1
    }

    /// Identifiers of the remote nodes this node follows.
    pub fn remote_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = guard(&self.remotes).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cluster-wide subscriber count of a room.
    pub async fn count_subscriptions(&self, room_id: &str) -> u64 {
        self.core.lock().await.state.count_subscriptions(room_id)
    }

    /// Every room, grouped by index and collection.
    pub async fn list_rooms(&self) -> RoomListing {
        self.core.lock().await.state.list_rooms()
    }

    /// Every registered authentication strategy.
    pub async fn auth_strategies(&self) -> Vec<AuthStrategy> {
        self.core.lock().await.state.auth_strategies()
    }

    /// Recent membership changes.
    pub fn activity(&self) -> Vec<ActivityEntry> {
        guard(&self.activity).entries()
    }

    fn record_activity(&self, node_id: &str, address: &str, event: ActivityEvent, reason: Option<&str>) {
        guard(&self.activity).record(node_id, address, event, reason);
    }

    /// Membership overview.
    pub async fn status(&self) -> Result<ClusterStatus> {
        let remote_ids = self.remote_ids();
        let mut nodes = Vec::with_capacity(remote_ids.len() + 1);
        if let Some(card) = self.ctx.idcards.card() {
            nodes.push(node_info(&card));
        }
        let mut remote_cards = self.ctx.idcards.remote_cards().await?;
        remote_cards.sort_by(|a, b| a.id.cmp(&b.id));
        nodes.extend(
            remote_cards
                .iter()
                .filter(|card| remote_ids.contains(&card.id))
                .map(node_info),
        );

        Ok(ClusterStatus {
            node_id: self.id().to_string(),
            phase: self.phase(),
            active_nodes: self.count_active_nodes(),
            nodes,
            activity: self.activity(),
        })
    }

    /// Resolves once the node has left the cluster.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await;
    }
}

fn node_info(card: &IdCard) -> NodeInfo {
    NodeInfo {
        id: card.id.clone(),
        ip: card.ip.clone(),
        birthdate: Utc
            .timestamp_millis_opt(card.birthdate)
            .single()
            .unwrap_or_default(),
    }
}

#[async_trait]
impl SyncHandler for Node {
    async fn apply(&self, from: &str, message_id: u64, message: SyncMessage) -> Result<()> {
        self.apply_remote(from, message_id, message).await
    }

    async fn evict_node(&self, node_id: &str, broadcast: bool, reason: &str) {
        Node::evict_node(self, node_id, broadcast, reason).await;
    }

    async fn evict_self(&self, reason: &str) {
        Node::evict_self(self, reason).await;
    }
}

#[async_trait]
impl CommandHandler for Node {
    async fn full_state(&self) -> Result<FullStateResponse> {
        self.snapshot().await
    }

    async fn add_node(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
        self.register_node(request).await
    }

    fn is_shutting_down(&self) -> bool {
        Node::is_shutting_down(self)
    }

    async fn server_failed(&self, error: ClusterError) {
        self.evict_self(&format!("command server failed: {}", error))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{
        EventSink, KvStore, MemoryKvStore, MemoryRealtime, MemoryStrategies, RecordingEvents,
    };
    use crate::config::ClusterConfig;
    use crate::idcard::{IdCardStore, KvIdCardStore};
    use rtsync_transport::MemoryHub;

    struct Harness {
        node: Arc<Node>,
        events: Arc<RecordingEvents>,
    }

    /// ID cards whose topology can never be updated.
    struct FrozenTopology(KvIdCardStore);

    #[async_trait]
    impl IdCardStore for FrozenTopology {
        async fn create(&self, ip: &str) -> Result<IdCard> {
            self.0.create(ip).await
        }

        fn card(&self) -> Option<IdCard> {
            self.0.card()
        }

        async fn refresh(&self) -> Result<()> {
            self.0.refresh().await
        }

        async fn add_node(&self, _node_id: &str) -> Result<()> {
            Err(ClusterError::Collaborator {
                collaborator: "kv",
                msg: "write refused".to_string(),
            })
        }

        async fn remove_node(&self, node_id: &str) -> Result<()> {
            self.0.remove_node(node_id).await
        }

        async fn dispose(&self) -> Result<()> {
            self.0.dispose().await
        }

        async fn remote_cards(&self) -> Result<Vec<IdCard>> {
            self.0.remote_cards().await
        }
    }

    fn harness(hub: &MemoryHub, kv: &Arc<dyn KvStore>, ip: &str) -> Harness {
        let (ctx, events) = context(hub, kv, ip);
        Harness {
            node: Node::new(ctx),
            events,
        }
    }

    fn context(
        hub: &MemoryHub,
        kv: &Arc<dyn KvStore>,
        ip: &str,
    ) -> (ClusterContext, Arc<RecordingEvents>) {
        let mut config = ClusterConfig::default();
        config.ip.address = Some(ip.parse().unwrap());
        let events = Arc::new(RecordingEvents::new());
        let sink: Arc<dyn EventSink> = events.clone();
        let ctx = ClusterContext::new(
            config,
            Arc::clone(kv),
            Arc::new(MemoryRealtime::new()),
            Arc::new(MemoryStrategies::new()),
            sink,
            Arc::new(hub.network(ip)),
        );
        (ctx, events)
    }

    fn room(room_id: &str) -> RoomFilter {
        RoomFilter {
            room_id: room_id.to_string(),
            index: "idx".to_string(),
            collection: "col".to_string(),
            filters: "{}".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_node_bootstraps_alone() {
        let hub = MemoryHub::new();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let h = harness(&hub, &kv, "10.0.0.1");

        h.node.init().await.unwrap();

        assert_eq!(h.node.phase(), NodePhase::Running);
        assert_eq!(h.node.count_active_nodes(), 1);
        assert!(h.node.remote_ids().is_empty());
        let activity = h.node.activity();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].event, ActivityEvent::Joined);
        assert_eq!(Some(activity[0].node_id.as_str()), h.node.node_id());
        assert!(h.events.contains(&LocalEvent::Health(NodeHealth::Ready)));
        assert!(hub.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_changes_apply_locally() {
        let hub = MemoryHub::new();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let h = harness(&hub, &kv, "10.0.0.1");
        h.node.init().await.unwrap();

        h.node.on_new_room(room("r1")).await.unwrap();
        h.node.on_subscription_added("r1").await.unwrap();
        h.node.on_subscription_added("r1").await.unwrap();
        h.node.on_subscription_removed("r1").await.unwrap();
        assert_eq!(h.node.count_subscriptions("r1").await, 1);
        assert_eq!(h.node.list_rooms().await["idx"]["col"]["r1"], 1);

        h.node.on_subscription_removed("r1").await.unwrap();
        assert!(matches!(
            h.node.on_subscription_removed("r1").await,
            Err(ClusterError::Desync { .. })
        ));
        h.node.on_room_removed("r1").await.unwrap();
        assert_eq!(h.node.count_subscriptions("r1").await, 0);
        assert!(h.node.list_rooms().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_address_refuses_to_join() {
        let hub = MemoryHub::new();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let first = harness(&hub, &kv, "10.0.0.1");
        first.node.init().await.unwrap();

        let twin = harness(&MemoryHub::new(), &kv, "10.0.0.1");
        assert!(matches!(
            twin.node.init().await,
            Err(ClusterError::Config { .. })
        ));
        assert_eq!(twin.node.phase(), NodePhase::ShuttingDown);
        assert!(twin
            .events
            .events()
            .iter()
            .any(|e| matches!(e, LocalEvent::Terminated { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let hub = MemoryHub::new();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let h = harness(&hub, &kv, "10.0.0.1");
        h.node.init().await.unwrap();

        h.node.shutdown("test").await;
        h.node.shutdown("test again").await;
        h.node.terminated().await;

        let terminations = h
            .events
            .events()
            .into_iter()
            .filter(|e| matches!(e, LocalEvent::Terminated { .. }))
            .count();
        assert_eq!(terminations, 1);
        assert!(kv.keys("cluster:idcard:").await.unwrap().is_empty());
        assert!(matches!(
            h.node.on_security_reset(),
            Err(ClusterError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_lists_self() {
        let hub = MemoryHub::new();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let h = harness(&hub, &kv, "10.0.0.1");
        h.node.init().await.unwrap();

        let status = h.node.status().await.unwrap();
        assert_eq!(Some(status.node_id.as_str()), h.node.node_id());
        assert_eq!(status.active_nodes, 1);
        assert_eq!(status.nodes.len(), 1);
        assert_eq!(status.nodes[0].ip, "10.0.0.1");
        assert_eq!(status.phase, NodePhase::Running);
    }

    #[tokio::test]
    async fn test_local_change_before_join_is_rejected() {
        let hub = MemoryHub::new();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let h = harness(&hub, &kv, "10.0.0.1");

        assert!(matches!(
            h.node.on_new_room(room("r1")).await,
            Err(ClusterError::NotJoined)
        ));
        assert!(matches!(
            h.node.on_security_reset(),
            Err(ClusterError::NotJoined)
        ));
        assert!(h.node.list_rooms().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_registration_is_rolled_back() {
        let hub = MemoryHub::new();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let (ctx, _) = context(&hub, &kv, "10.0.0.1");
        let frozen = Arc::new(FrozenTopology(KvIdCardStore::new(
            Arc::clone(&kv),
            ctx.config.idcard_ttl(),
        )));
        let first = Node::new(ctx.with_idcards(frozen));
        first.init().await.unwrap();

        let joiner = harness(&hub, &kv, "10.0.0.2");
        joiner.node.init().await.unwrap();

        assert!(first.remote_ids().is_empty());
        assert_eq!(first.count_active_nodes(), 1);
        assert!(first.core.lock().await.applied.is_empty());
        assert!(joiner.node.remote_ids().is_empty());
        assert!(first.activity().iter().all(|entry| entry.node_id != joiner.node.node_id().unwrap()));
    }
}
