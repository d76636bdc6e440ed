//! Inbound side of the sync channel, one [`Subscriber`] per remote node.
//!
//! A subscriber starts buffering: the node does not know yet from which
//! sequence number the remote's messages must be applied. Once
//! [`Subscriber::sync`] provides that number, buffered messages are replayed
//! and later ones are applied on receipt. Sequence numbers must then follow
//! each other without gaps; anything else means lost messages and this node
//! can no longer trust its replicated state.
//!
//! Messages are applied while holding the pipeline lock, so a message
//! received during the replay waits for the replay to finish.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rtsync_transport::{Network, SyncSource};

use crate::error::{ClusterError, Result};
use crate::ip::endpoint;
use crate::messages::{decode_sync, SyncMessage};

/// Callbacks a subscriber drives on the node owning it.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// Apply a message received from `from`.
    async fn apply(&self, from: &str, message_id: u64, message: SyncMessage) -> Result<()>;

    /// Remove a remote node from the cluster.
    async fn evict_node(&self, node_id: &str, broadcast: bool, reason: &str);

    /// Leave the cluster: the local state cannot be trusted anymore.
    async fn evict_self(&self, reason: &str);
}

/// Lifecycle of a [`Subscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Messages are stored until the starting sequence number is known.
    Buffering,
    /// Messages are applied on receipt.
    Sane,
    /// One heartbeat check passed without news from the remote node.
    MissingHeartbeat,
    /// Terminal.
    Evicted,
}

struct Status {
    state: SubscriberState,
    synced: bool,
    last_heartbeat: Instant,
    evictable: bool,
}

#[derive(Default)]
struct Pipeline {
    expected: u64,
    buffer: VecDeque<(u64, SyncMessage)>,
}

enum Action {
    EvictRemote(String),
    EvictSelf(String),
}

struct Shared {
    remote_id: String,
    remote_ip: String,
    heartbeat_check: Duration,
    status: Mutex<Status>,
    pipeline: tokio::sync::Mutex<Pipeline>,
    last_message_id: AtomicU64,
    handler: Weak<dyn SyncHandler>,
    cancel: CancellationToken,
}

/// Replication stream from one remote node.
pub struct Subscriber {
    shared: Arc<Shared>,
}

impl Subscriber {
    /// Subscribe to the broadcast socket of a remote node and start buffering.
    ///
    /// `heartbeat_check` is the delay between two liveness checks.
    pub async fn connect(
        network: &dyn Network,
        remote_id: &str,
        remote_ip: &str,
        sync_port: u16,
        heartbeat_check: Duration,
        handler: Weak<dyn SyncHandler>,
    ) -> Result<Self> {
        let source = network.subscribe(&endpoint(remote_ip, sync_port)).await?;
        let shared = Arc::new(Shared {
            remote_id: remote_id.to_string(),
            remote_ip: remote_ip.to_string(),
            heartbeat_check,
            status: Mutex::new(Status {
                state: SubscriberState::Buffering,
                synced: false,
                last_heartbeat: Instant::now(),
                evictable: true,
            }),
            pipeline: tokio::sync::Mutex::new(Pipeline::default()),
            last_message_id: AtomicU64::new(0),
            handler,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(receive_loop(Arc::clone(&shared), source));
        tokio::spawn(heartbeat_loop(Arc::clone(&shared)));
        debug!(remote = remote_id, ip = remote_ip, "[CLUSTER] subscribed to remote node");
        Ok(Self { shared })
    }

    /// Current state.
    pub fn state(&self) -> SubscriberState {
        self.shared.status().state
    }

    /// Sequence number of the last message applied (or the sync start point).
    pub fn last_message_id(&self) -> u64 {
        self.shared.last_message_id.load(Ordering::SeqCst)
    }

    /// Whether heartbeat loss may evict the remote node.
    pub fn is_evictable(&self) -> bool {
        self.shared.status().evictable
    }

    /// Set the starting sequence number, replay buffered messages and switch to
    /// immediate application.
    ///
    /// Buffered messages numbered `start` or below predate the snapshot and are
    /// dropped. Fails on a sequence gap or when applying a message fails.
    pub async fn sync(&self, start: u64) -> Result<()> {
        let shared = &self.shared;
        let mut pipeline = shared.pipeline.lock().await;
        pipeline.expected = start;
        shared.last_message_id.store(start, Ordering::SeqCst);

        while let Some((message_id, message)) = pipeline.buffer.pop_front() {
            if message_id <= pipeline.expected {
                continue;
            }
            match shared.process(&mut pipeline, message_id, message).await {
                None => {}
                Some(Action::EvictSelf(reason)) => {
                    return Err(ClusterError::desync(reason));
                }
                Some(Action::EvictRemote(reason)) => {
                    return Err(ClusterError::ProtocolViolation {
                        node_id: shared.remote_id.clone(),
                        msg: reason,
                    });
                }
            }
        }

        let mut status = shared.status();
        status.synced = true;
        if status.state == SubscriberState::Buffering {
            status.state = SubscriberState::Sane;
        }
        debug!(remote = %shared.remote_id, start, "[CLUSTER] subscriber synchronized");
        Ok(())
    }

    /// Stop receiving and checking heartbeats. Idempotent; never waits on a message
    /// being applied.
    pub fn dispose(&self) {
        let mut status = self.shared.status();
        if status.state == SubscriberState::Evicted {
            return;
        }
        status.state = SubscriberState::Evicted;
        self.shared.cancel.cancel();
        debug!(remote = %self.shared.remote_id, "[CLUSTER] subscriber disposed");
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_evicted(&self) -> bool {
        self.status().state == SubscriberState::Evicted
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) -> Option<Action> {
        let (message_id, message) = match decode_sync(&self.remote_id, topic, payload) {
            Ok(decoded) => decoded,
            Err(e) => return Some(Action::EvictRemote(e.to_string())),
        };

        let mut pipeline = self.pipeline.lock().await;
        let synced = {
            let mut status = self.status();
            if status.state == SubscriberState::Evicted {
                return None;
            }
            status.last_heartbeat = Instant::now();
            status.synced
        };

        if !synced {
            pipeline.buffer.push_back((message_id, message));
            return None;
        }
        self.process(&mut pipeline, message_id, message).await
    }

    async fn process(
        &self,
        pipeline: &mut Pipeline,
        message_id: u64,
        message: SyncMessage,
    ) -> Option<Action> {
        if message_id != pipeline.expected + 1 {
            return Some(Action::EvictSelf(format!(
                "message {} received from {}, expected {}",
                message_id,
                self.remote_id,
                pipeline.expected + 1
            )));
        }
        pipeline.expected = message_id;
        self.last_message_id.store(message_id, Ordering::SeqCst);

        if let SyncMessage::DebugPreventEviction { evictable } = message {
            info!(remote = %self.remote_id, evictable, "[CLUSTER] eviction prevention toggled");
            self.status().evictable = evictable;
        }

        let handler = self.handler.upgrade()?;
        let topic = message.topic();
        match handler.apply(&self.remote_id, message_id, message).await {
            Ok(()) => None,
            Err(e) => Some(Action::EvictSelf(format!(
                "failed to apply {} message {} from {}: {}",
                topic, message_id, self.remote_id, e
            ))),
        }
    }

    fn check_heartbeat(&self) -> Option<Action> {
        let mut status = self.status();
        if status.state == SubscriberState::Evicted {
            return None;
        }
        let now = Instant::now();
        if !status.evictable {
            status.last_heartbeat = now;
        }

        if now.duration_since(status.last_heartbeat) >= self.heartbeat_check {
            if status.state == SubscriberState::MissingHeartbeat {
                return Some(Action::EvictRemote("heartbeat timeout".to_string()));
            }
            warn!(remote = %self.remote_id, ip = %self.remote_ip, "[CLUSTER] heartbeat missed");
            status.state = SubscriberState::MissingHeartbeat;
        } else if status.state == SubscriberState::MissingHeartbeat {
            info!(remote = %self.remote_id, "[CLUSTER] heartbeat recovered");
            status.state = if status.synced {
                SubscriberState::Sane
            } else {
                SubscriberState::Buffering
            };
        }
        None
    }

    async fn run(&self, action: Action) {
        let Some(handler) = self.handler.upgrade() else {
            return;
        };
        match action {
            Action::EvictRemote(reason) => {
                warn!(remote = %self.remote_id, ip = %self.remote_ip, reason = %reason, "[CLUSTER] evicting remote node");
                handler.evict_node(&self.remote_id, true, &reason).await;
            }
            Action::EvictSelf(reason) => {
                error!(remote = %self.remote_id, reason = %reason, "[CLUSTER] replication broken");
                handler.evict_self(&reason).await;
            }
        }
    }
}

async fn receive_loop(shared: Arc<Shared>, mut source: Box<dyn SyncSource>) {
    loop {
        let received = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            received = source.recv() => received,
        };
        let Some((topic, payload)) = received else {
            debug!(remote = %shared.remote_id, "[CLUSTER] remote sync socket closed");
            break;
        };
        if let Some(action) = shared.on_message(&topic, &payload).await {
            if !shared.is_evicted() {
                shared.run(action).await;
            }
            break;
        }
    }
}

async fn heartbeat_loop(shared: Arc<Shared>) {
    let period = shared.heartbeat_check;
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Some(action) = shared.check_heartbeat() {
            shared.run(action).await;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtsync_transport::{MemoryHub, SyncSink};

    const CHECK: Duration = Duration::from_millis(3000);

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<(u64, SyncMessage)>>,
        evicted: Mutex<Vec<(String, bool)>>,
        self_evictions: Mutex<Vec<String>>,
        fail_on: Option<u64>,
    }

    impl Recorder {
        fn applied_ids(&self) -> Vec<u64> {
            self.applied.lock().unwrap().iter().map(|(id, _)| *id).collect()
        }
    }

    #[async_trait]
    impl SyncHandler for Recorder {
        async fn apply(&self, _from: &str, message_id: u64, message: SyncMessage) -> Result<()> {
            if self.fail_on == Some(message_id) {
                return Err(ClusterError::desync("unknown room"));
            }
            self.applied.lock().unwrap().push((message_id, message));
            Ok(())
        }

        async fn evict_node(&self, node_id: &str, broadcast: bool, _reason: &str) {
            self.evicted.lock().unwrap().push((node_id.to_string(), broadcast));
        }

        async fn evict_self(&self, reason: &str) {
            self.self_evictions.lock().unwrap().push(reason.to_string());
        }
    }

    struct Fixture {
        sink: Arc<dyn SyncSink>,
        recorder: Arc<Recorder>,
        subscriber: Subscriber,
    }

    async fn fixture(recorder: Recorder) -> Fixture {
        let hub = MemoryHub::new();
        let sink = hub.network("10.0.0.1").bind_publisher("10.0.0.1:7511").await.unwrap();
        let recorder = Arc::new(recorder);
        let handler: Arc<dyn SyncHandler> = recorder.clone();
        let subscriber = Subscriber::connect(
            &hub.network("10.0.0.2"),
            "remote",
            "10.0.0.1",
            7511,
            CHECK,
            Arc::downgrade(&handler),
        )
        .await
        .unwrap();
        Fixture {
            sink,
            recorder,
            subscriber,
        }
    }

    fn subscription(room: &str) -> SyncMessage {
        SyncMessage::Subscription {
            room_id: room.to_string(),
        }
    }

    async fn publish(sink: &Arc<dyn SyncSink>, message_id: u64, message: SyncMessage) {
        sink.publish(message.topic(), &message.encode(message_id).unwrap())
            .await
            .unwrap();
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_buffered_messages_replay_in_order_after_sync() {
        let f = fixture(Recorder::default()).await;
        for id in 3..=7 {
            publish(&f.sink, id, subscription("r1")).await;
        }
        settle().await;
        assert_eq!(f.subscriber.state(), SubscriberState::Buffering);
        assert!(f.recorder.applied_ids().is_empty());

        f.subscriber.sync(4).await.unwrap();
        assert_eq!(f.recorder.applied_ids(), vec![5, 6, 7]);
        assert_eq!(f.subscriber.state(), SubscriberState::Sane);
        assert_eq!(f.subscriber.last_message_id(), 7);

        publish(&f.sink, 8, subscription("r1")).await;
        settle().await;
        assert_eq!(f.recorder.applied_ids(), vec![5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_gap_after_sync_evicts_self() {
        let f = fixture(Recorder::default()).await;
        f.subscriber.sync(0).await.unwrap();
        publish(&f.sink, 1, subscription("r1")).await;
        publish(&f.sink, 3, subscription("r1")).await;
        settle().await;

        assert_eq!(f.recorder.applied_ids(), vec![1]);
        assert_eq!(f.recorder.self_evictions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gap_in_buffer_fails_sync() {
        let f = fixture(Recorder::default()).await;
        publish(&f.sink, 5, subscription("r1")).await;
        publish(&f.sink, 7, subscription("r1")).await;
        settle().await;
        assert!(matches!(
            f.subscriber.sync(4).await,
            Err(ClusterError::Desync { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_topic_evicts_remote_with_broadcast() {
        let f = fixture(Recorder::default()).await;
        f.sink.publish("NoSuchTopic", &[1, 2, 3]).await.unwrap();
        settle().await;
        assert_eq!(
            *f.recorder.evicted.lock().unwrap(),
            vec![("remote".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_handler_error_evicts_self() {
        let f = fixture(Recorder {
            fail_on: Some(2),
            ..Recorder::default()
        })
        .await;
        f.subscriber.sync(0).await.unwrap();
        publish(&f.sink, 1, subscription("r1")).await;
        publish(&f.sink, 2, subscription("r1")).await;
        settle().await;
        let reasons = f.recorder.self_evictions.lock().unwrap().clone();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("unknown room"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loss_evicts_remote() {
        let f = fixture(Recorder::default()).await;
        f.subscriber.sync(0).await.unwrap();

        tokio::time::sleep(CHECK + Duration::from_millis(10)).await;
        assert_eq!(f.subscriber.state(), SubscriberState::MissingHeartbeat);
        assert!(f.recorder.evicted.lock().unwrap().is_empty());

        tokio::time::sleep(CHECK).await;
        assert_eq!(
            *f.recorder.evicted.lock().unwrap(),
            vec![("remote".to_string(), true)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_recovery() {
        let f = fixture(Recorder::default()).await;
        tokio::time::sleep(CHECK + Duration::from_millis(10)).await;
        assert_eq!(f.subscriber.state(), SubscriberState::MissingHeartbeat);

        publish(&f.sink, 1, SyncMessage::Heartbeat { address: "10.0.0.1".to_string() }).await;
        tokio::time::sleep(CHECK).await;
        assert_eq!(f.subscriber.state(), SubscriberState::Buffering);
        assert!(f.recorder.evicted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prevent_eviction_suspends_heartbeat_check() {
        let f = fixture(Recorder::default()).await;
        f.subscriber.sync(0).await.unwrap();
        publish(&f.sink, 1, SyncMessage::DebugPreventEviction { evictable: false }).await;
        settle().await;
        assert!(!f.subscriber.is_evictable());

        tokio::time::sleep(CHECK * 10).await;
        assert!(f.recorder.evicted.lock().unwrap().is_empty());
        assert_eq!(f.recorder.applied_ids(), vec![1]);
        assert_eq!(f.subscriber.state(), SubscriberState::Sane);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_stops_delivery() {
        let f = fixture(Recorder::default()).await;
        f.subscriber.sync(0).await.unwrap();
        f.subscriber.dispose();
        f.subscriber.dispose();
        assert_eq!(f.subscriber.state(), SubscriberState::Evicted);

        publish(&f.sink, 1, subscription("r1")).await;
        settle().await;
        assert!(f.recorder.applied_ids().is_empty());
    }
}
