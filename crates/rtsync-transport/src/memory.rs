//! In-process network for tests.
//!
//! A [`MemoryHub`] plays the role of the wire: every node gets its own
//! [`MemoryNetwork`] view, tagged with the node's host, and all views share
//! the hub. Broadcasts travel over unbounded tokio channels, requests call
//! the bound handler directly. The hub can cut the link between two hosts,
//! make a host ignore requests, and records every request it routes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};
use crate::transport::{
    CommandEndpoint, Network, RequestHandler, Requester, SyncSink, SyncSource,
};

type Message = (String, Vec<u8>);

struct SubscriberLink {
    host: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct HubState {
    publishers: HashSet<String>,
    subscriptions: HashMap<String, Vec<SubscriberLink>>,
    servers: HashMap<String, Arc<dyn RequestHandler>>,
    partitions: HashSet<(String, String)>,
    unresponsive: HashSet<String>,
    requests: Vec<String>,
}

impl HubState {
    fn linked(&self, a: &str, b: &str) -> bool {
        !self.partitions.contains(&(a.to_string(), b.to_string()))
            && !self.partitions.contains(&(b.to_string(), a.to_string()))
    }
}

/// Shared in-process wire.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Network view for a node running on `host`.
    pub fn network(&self, host: &str) -> MemoryNetwork {
        MemoryNetwork {
            hub: self.clone(),
            host: host.to_string(),
        }
    }

    /// Cut every link between two hosts, both directions.
    pub fn partition(&self, a: &str, b: &str) {
        let mut state = self.lock();
        state.partitions.insert((a.to_string(), b.to_string()));
    }

    /// Restore the link between two hosts.
    pub fn heal(&self, a: &str, b: &str) {
        let mut state = self.lock();
        state.partitions.remove(&(a.to_string(), b.to_string()));
        state.partitions.remove(&(b.to_string(), a.to_string()));
    }

    /// Requests to `addr` never get a reply and time out.
    pub fn set_unresponsive(&self, addr: &str, unresponsive: bool) {
        let mut state = self.lock();
        if unresponsive {
            state.unresponsive.insert(addr.to_string());
        } else {
            state.unresponsive.remove(addr);
        }
    }

    /// Addresses of every routed request, in order.
    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One node's view of a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: MemoryHub,
    host: String,
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn bind_publisher(&self, addr: &str) -> Result<Arc<dyn SyncSink>> {
        let mut state = self.hub.lock();
        if !state.publishers.insert(addr.to_string()) {
            return Err(TransportError::AddressInUse {
                addr: addr.to_string(),
            });
        }
        Ok(Arc::new(MemorySink {
            hub: self.hub.clone(),
            addr: addr.to_string(),
        }))
    }

    async fn subscribe(&self, addr: &str) -> Result<Box<dyn SyncSource>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.hub.lock();
        state
            .subscriptions
            .entry(addr.to_string())
            .or_default()
            .push(SubscriberLink {
                host: self.host.clone(),
                tx,
            });
        Ok(Box::new(MemorySource { rx }))
    }

    async fn bind_command(
        &self,
        addr: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn CommandEndpoint>> {
        let mut state = self.hub.lock();
        if state.servers.contains_key(addr) {
            return Err(TransportError::AddressInUse {
                addr: addr.to_string(),
            });
        }
        state.servers.insert(addr.to_string(), handler);
        Ok(Arc::new(MemoryEndpoint {
            hub: self.hub.clone(),
            addr: addr.to_string(),
            closed: CancellationToken::new(),
        }))
    }

    fn requester(&self) -> Arc<dyn Requester> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl Requester for MemoryNetwork {
    async fn request(
        &self,
        addr: &str,
        topic: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let handler = {
            let mut state = self.hub.lock();
            state.requests.push(addr.to_string());
            let reachable = state.linked(&self.host, host_of(addr)) && !state.unresponsive.contains(addr);
            match state.servers.get(addr) {
                Some(handler) if reachable => Some(Arc::clone(handler)),
                Some(_) => None,
                None => {
                    return Err(TransportError::ConnectionRefused {
                        addr: addr.to_string(),
                    })
                }
            }
        };

        let timed_out = TransportError::RequestTimeout {
            addr: addr.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        match handler {
            Some(handler) => tokio::time::timeout(timeout, handler.handle(topic, payload))
                .await
                .map(|reply| reply.unwrap_or_default())
                .map_err(|_| timed_out),
            None => {
                tokio::time::sleep(timeout).await;
                Err(timed_out)
            }
        }
    }
}

struct MemorySink {
    hub: MemoryHub,
    addr: String,
}

#[async_trait]
impl SyncSink for MemorySink {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut state = self.hub.lock();
        if !state.publishers.contains(&self.addr) {
            return Err(TransportError::Closed);
        }
        let from = host_of(&self.addr).to_string();
        let partitions = state.partitions.clone();
        if let Some(links) = state.subscriptions.get_mut(&self.addr) {
            links.retain(|link| {
                let cut = partitions.contains(&(from.clone(), link.host.clone()))
                    || partitions.contains(&(link.host.clone(), from.clone()));
                cut || link.tx.send((topic.to_string(), payload.to_vec())).is_ok()
            });
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.hub.lock();
        state.publishers.remove(&self.addr);
        state.subscriptions.remove(&self.addr);
    }

    async fn disconnect(&self, host: &str) {
        let mut state = self.hub.lock();
        if let Some(links) = state.subscriptions.get_mut(&self.addr) {
            links.retain(|link| link.host != host);
        }
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Message>,
}

#[async_trait]
impl SyncSource for MemorySource {
    async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

struct MemoryEndpoint {
    hub: MemoryHub,
    addr: String,
    closed: CancellationToken,
}

#[async_trait]
impl CommandEndpoint for MemoryEndpoint {
    async fn close(&self) {
        self.hub.lock().servers.remove(&self.addr);
        self.closed.cancel();
    }

    async fn wait(&self) -> Result<()> {
        self.closed.cancelled().await;
        Ok(())
    }

    fn local_addr(&self) -> String {
        self.addr.clone()
    }
}
