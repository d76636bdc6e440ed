//! Outbound side of the sync channel.
//!
//! The publisher stamps every message with the next sequence number and
//! queues it; a single drain task hands queued messages to the broadcast
//! socket one at a time, so the wire order always matches the numbering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use rtsync_transport::SyncSink;

use crate::messages::SyncMessage;

enum Outgoing {
    Message {
        message_id: u64,
        topic: &'static str,
        payload: Vec<u8>,
    },
    Disconnect(String),
}

struct Outbox {
    last_id: u64,
    queue: Option<mpsc::UnboundedSender<Outgoing>>,
}

#[derive(Default)]
struct PublisherStatsInner {
    queued: AtomicU64,
    sent: AtomicU64,
    send_errors: AtomicU64,
}

/// Snapshot of publisher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Messages accepted by [`Publisher::send`].
    pub queued: u64,
    /// Messages handed to the socket.
    pub sent: u64,
    /// Messages the socket refused.
    pub send_errors: u64,
}

/// Sequenced broadcaster of [`SyncMessage`]s.
pub struct Publisher {
    outbox: Mutex<Outbox>,
    stats: Arc<PublisherStatsInner>,
    drain: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    sink: Arc<dyn SyncSink>,
}

impl Publisher {
    /// Start publishing on a bound broadcast socket.
    pub fn new(sink: Arc<dyn SyncSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(PublisherStatsInner::default());
        let drain = tokio::spawn(drain(rx, Arc::clone(&sink), Arc::clone(&stats)));
        Self {
            outbox: Mutex::new(Outbox {
                last_id: 0,
                queue: Some(tx),
            }),
            stats,
            drain: tokio::sync::Mutex::new(Some(drain)),
            sink,
        }
    }

    fn outbox(&self) -> std::sync::MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a message and return the sequence number assigned to it.
    ///
    /// Never blocks and never fails: delivery problems are only logged.
    pub fn send(&self, message: &SyncMessage) -> u64 {
        let mut outbox = self.outbox();
        let message_id = outbox.last_id + 1;
        let payload = match message.encode(message_id) {
            Ok(payload) => payload,
            Err(e) => {
                error!(topic = message.topic(), error = %e, "[CLUSTER] cannot encode sync message");
                return outbox.last_id;
            }
        };
        outbox.last_id = message_id;

        let outgoing = Outgoing::Message {
            message_id,
            topic: message.topic(),
            payload,
        };
        match outbox.queue.as_ref() {
            Some(queue) if queue.send(outgoing).is_ok() => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
            }
            _ => debug!(message_id, topic = message.topic(), "[CLUSTER] publisher disposed, message dropped"),
        }
        message_id
    }

    /// Sequence number of the last message accepted by [`send`](Self::send).
    pub fn last_message_id(&self) -> u64 {
        self.outbox().last_id
    }

    /// Counters.
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            queued: self.stats.queued.load(Ordering::Relaxed),
            sent: self.stats.sent.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
        }
    }

    /// Close the connections of subscribers running on `ip`, once every
    /// message queued so far has been handed to the socket.
    pub fn disconnect(&self, ip: &str) {
        if let Some(queue) = self.outbox().queue.as_ref() {
            let _ = queue.send(Outgoing::Disconnect(ip.to_string()));
        }
    }

    /// Deliver everything still queued, then close the socket. Idempotent.
    pub async fn dispose(&self) {
        let queue = self.outbox().queue.take();
        drop(queue);

        let drain = self.drain.lock().await.take();
        if let Some(drain) = drain {
            if let Err(e) = drain.await {
                warn!(error = %e, "[CLUSTER] publisher drain task failed");
            }
            self.sink.close().await;
        }
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    sink: Arc<dyn SyncSink>,
    stats: Arc<PublisherStatsInner>,
) {
    let mut batch = Vec::new();
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }
        for outgoing in batch.drain(..) {
            let (message_id, topic, payload) = match outgoing {
                Outgoing::Message {
                    message_id,
                    topic,
                    payload,
                } => (message_id, topic, payload),
                Outgoing::Disconnect(ip) => {
                    debug!(ip = %ip, "[CLUSTER] closing subscriber connections");
                    sink.disconnect(&ip).await;
                    continue;
                }
            };
            match sink.publish(topic, &payload).await {
                Ok(()) => {
                    stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        message_id,
                        topic,
                        error = %e,
                        "[CLUSTER] failed to publish sync message"
                    );
                }
            }
        }
    }
}
