//! Broadcast sockets over TCP.
//!
//! A [`TcpPublisher`] accepts any number of subscriber connections. Each
//! connection gets its own bounded queue and writer task, so a subscriber
//! that stops reading only delays itself: it is dropped once its queue
//! overflows or a write misses [`WRITE_TIMEOUT`]. A [`TcpSubscriber`] keeps a
//! connection to one remote publisher and reconnects if it drops; messages
//! published while disconnected are lost, which receivers detect through
//! their sequence numbers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::{Frame, FrameKind};
use crate::tcp::{TcpConnection, TcpTransport};
use crate::transport::{SyncSink, SyncSource};

/// Delay between two connection attempts of a subscriber.
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Frames waiting for one subscriber before it is considered stalled.
pub const SUBSCRIBER_QUEUE: usize = 1024;

/// Longest a single frame write to one subscriber may take.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct SubscriberLink {
    peer_addr: String,
    peer_host: String,
    queue: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl SubscriberLink {
    fn spawn(conn: TcpConnection) -> Self {
        let peer_addr = conn.peer_addr().to_string();
        let peer_host = peer_addr
            .parse::<SocketAddr>()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| peer_addr.clone());
        let (queue, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let cancel = CancellationToken::new();
        tokio::spawn(write_subscriber(conn, rx, cancel.clone()));
        Self {
            peer_addr,
            peer_host,
            queue,
            cancel,
        }
    }
}

type Links = Arc<Mutex<Vec<SubscriberLink>>>;

fn lock(links: &Mutex<Vec<SubscriberLink>>) -> MutexGuard<'_, Vec<SubscriberLink>> {
    links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Broadcast-publish endpoint.
pub struct TcpPublisher {
    local_addr: String,
    subscribers: Links,
    cancel: CancellationToken,
}

impl TcpPublisher {
    /// Bind the endpoint and start accepting subscribers.
    pub async fn bind(transport: TcpTransport, addr: &str) -> Result<Self> {
        let listener = transport.listen(addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        let subscribers: Links = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(accept_subscribers(
            transport,
            listener,
            Arc::clone(&subscribers),
            cancel.clone(),
        ));

        debug!(addr = %local_addr, "publisher bound");
        Ok(Self {
            local_addr,
            subscribers,
            cancel,
        })
    }

    /// Number of currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

async fn accept_subscribers(
    transport: TcpTransport,
    listener: TcpListener,
    subscribers: Links,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = transport.accept(&listener) => accepted,
        };
        match accepted {
            Ok(conn) => {
                debug!(peer = conn.peer_addr(), "subscriber connected");
                lock(&subscribers).push(SubscriberLink::spawn(conn));
            }
            Err(e) => warn!(error = %e, "failed to accept subscriber"),
        }
    }
}

/// Write queued frames to one subscriber until its queue closes, a write
/// fails or times out, or the link is cancelled.
async fn write_subscriber(
    conn: TcpConnection,
    mut queue: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let encoded = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(encoded) => encoded,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = tokio::time::timeout(WRITE_TIMEOUT, conn.send_encoded(&encoded)) => written,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(peer = conn.peer_addr(), error = %e, "subscriber write failed");
                break;
            }
            Err(_) => {
                warn!(peer = conn.peer_addr(), "subscriber write timed out, dropping it");
                break;
            }
        }
    }
    conn.shutdown().await;
}

#[async_trait]
impl SyncSink for TcpPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let encoded = Frame::new(FrameKind::Publish, topic, payload.to_vec())
            .encode()?
            .freeze();
        lock(&self.subscribers).retain(|link| match link.queue.try_send(encoded.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(peer = %link.peer_addr, "subscriber is not keeping up, dropping it");
                link.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(peer = %link.peer_addr, "dropping subscriber");
                false
            }
        });
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
        // dropping the queues lets each writer flush what it holds, then shut down
        lock(&self.subscribers).clear();
    }

    async fn disconnect(&self, host: &str) {
        lock(&self.subscribers).retain(|link| {
            if link.peer_host != host {
                return true;
            }
            debug!(peer = %link.peer_addr, "disconnecting subscriber");
            link.cancel.cancel();
            false
        });
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

/// Subscription to one remote publisher.
pub struct TcpSubscriber {
    transport: TcpTransport,
    addr: String,
    conn: Option<TcpConnection>,
}

impl TcpSubscriber {
    /// Create the subscription, connecting eagerly when the publisher is reachable.
    pub async fn connect(transport: TcpTransport, addr: &str) -> Self {
        let conn = match transport.connect(addr).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                debug!(addr = addr, error = %e, "publisher not reachable yet");
                None
            }
        };
        Self {
            transport,
            addr: addr.to_string(),
            conn,
        }
    }
}

#[async_trait]
impl SyncSource for TcpSubscriber {
    async fn recv(&mut self) -> Option<(String, Vec<u8>)> {
        loop {
            let conn = match self.conn.take() {
                Some(conn) => conn,
                None => match self.transport.connect(&self.addr).await {
                    Ok(conn) => conn,
                    Err(_) => {
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                },
            };

            match conn.recv_frame().await {
                Ok(frame) if frame.kind == FrameKind::Publish => {
                    self.conn = Some(conn);
                    return Some((frame.topic, frame.payload));
                }
                Ok(frame) => {
                    warn!(addr = %self.addr, kind = ?frame.kind, "ignoring non-publish frame");
                    self.conn = Some(conn);
                }
                Err(e) => {
                    debug!(addr = %self.addr, error = %e, "publisher connection lost");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}
