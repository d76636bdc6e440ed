//! Request/reply control channel.
//!
//! Every node serves two requests: a full state transfer for joining nodes,
//! and the handshake by which a joining node introduces itself. The client
//! side degrades to "no answer" on timeouts instead of failing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use rtsync_transport::{CommandEndpoint, Network, RequestHandler, Requester};

use crate::error::{ClusterError, Result};
use crate::idcard::IdCard;
use crate::ip::endpoint;
use crate::messages::{
    decode, encode, FullStateResponse, HandshakeRequest, HandshakeResponse, TOPIC_FULLSTATE,
    TOPIC_HANDSHAKE,
};

/// Node-side implementation of the served requests.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Snapshot of the replicated state and of every known sequence position.
    async fn full_state(&self) -> Result<FullStateResponse>;

    /// Register a node that is joining the cluster.
    async fn add_node(&self, request: HandshakeRequest) -> Result<HandshakeResponse>;

    /// Whether the node is leaving; errors are expected then.
    fn is_shutting_down(&self) -> bool;

    /// The server stopped unexpectedly.
    async fn server_failed(&self, error: ClusterError);
}

struct Dispatcher {
    handler: Weak<dyn CommandHandler>,
}

impl Dispatcher {
    async fn dispatch(
        handler: &dyn CommandHandler,
        topic: &str,
        payload: &[u8],
    ) -> Option<Result<Vec<u8>>> {
        match topic {
            TOPIC_FULLSTATE => Some(handler.full_state().await.and_then(|state| encode(&state))),
            TOPIC_HANDSHAKE => {
                let reply = match decode::<HandshakeRequest>(payload) {
                    Ok(request) => handler.add_node(request).await,
                    Err(e) => Err(e),
                };
                Some(reply.and_then(|reply| encode(&reply)))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, topic: &str, payload: Vec<u8>) -> Option<Vec<u8>> {
        let handler = self.handler.upgrade()?;
        match Self::dispatch(handler.as_ref(), topic, &payload).await {
            Some(Ok(reply)) => Some(reply),
            Some(Err(e)) => {
                if !handler.is_shutting_down() {
                    warn!(topic, error = %e, "[CLUSTER] command request failed");
                }
                None
            }
            None => {
                debug!(topic, "[CLUSTER] unknown command discarded");
                None
            }
        }
    }
}

/// Bound command server.
pub struct CommandServer {
    endpoint: Arc<dyn CommandEndpoint>,
}

impl CommandServer {
    /// Bind the request/reply endpoint and serve requests with `handler`.
    pub async fn bind(
        network: &dyn Network,
        addr: &str,
        handler: Weak<dyn CommandHandler>,
    ) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher {
            handler: handler.clone(),
        });
        let endpoint = network.bind_command(addr, dispatcher).await?;

        let watched = Arc::clone(&endpoint);
        tokio::spawn(async move {
            let Err(e) = watched.wait().await else {
                return;
            };
            let Some(handler) = handler.upgrade() else {
                return;
            };
            if handler.is_shutting_down() {
                debug!(error = %e, "[CLUSTER] command server stopped during shutdown");
                return;
            }
            error!(error = %e, "[CLUSTER] command server failed");
            handler.server_failed(e.into()).await;
        });

        debug!(addr = %endpoint.local_addr(), "[CLUSTER] command server bound");
        Ok(Self { endpoint })
    }

    /// Stop serving.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

/// Client for the command channel of remote nodes.
#[derive(Clone)]
pub struct CommandClient {
    requester: Arc<dyn Requester>,
    command_port: u16,
    command_timeout: Duration,
    handshake_timeout: Duration,
}

impl CommandClient {
    /// Create a client reaching peers on `command_port`.
    pub fn new(
        requester: Arc<dyn Requester>,
        command_port: u16,
        command_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            requester,
            command_port,
            command_timeout,
            handshake_timeout,
        }
    }

    /// Fetch the full state from a random peer, falling back on the others.
    pub async fn get_full_state(&self, peers: &[IdCard]) -> Option<FullStateResponse> {
        if peers.is_empty() {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..peers.len());
        self.fetch_full_state(peers, start).await
    }

    /// Ask peers in round-robin order starting at `start`, each one once.
    pub async fn fetch_full_state(
        &self,
        peers: &[IdCard],
        start: usize,
    ) -> Option<FullStateResponse> {
        for offset in 0..peers.len() {
            let peer = &peers[(start + offset) % peers.len()];
            let addr = endpoint(&peer.ip, self.command_port);
            match self
                .requester
                .request(&addr, TOPIC_FULLSTATE, Vec::new(), self.command_timeout)
                .await
            {
                Ok(reply) if reply.is_empty() => {
                    debug!(peer = %peer.id, "[CLUSTER] full state request discarded");
                }
                Ok(reply) => match decode::<FullStateResponse>(&reply) {
                    Ok(state) => return Some(state),
                    Err(e) => warn!(peer = %peer.id, error = %e, "[CLUSTER] malformed full state"),
                },
                Err(e) => warn!(peer = %peer.id, error = %e, "[CLUSTER] full state request failed"),
            }
        }
        None
    }

    /// Send the handshake to every peer concurrently.
    ///
    /// Peers that do not answer map to `None`.
    pub async fn broadcast_handshake(
        &self,
        peers: &[IdCard],
        request: &HandshakeRequest,
    ) -> Result<HashMap<String, Option<HandshakeResponse>>> {
        let payload = encode(request)?;
        let mut requests = JoinSet::new();
        for peer in peers {
            let requester = Arc::clone(&self.requester);
            let addr = endpoint(&peer.ip, self.command_port);
            let peer_id = peer.id.clone();
            let payload = payload.clone();
            let timeout = self.handshake_timeout;
            requests.spawn(async move {
                let reply = requester
                    .request(&addr, TOPIC_HANDSHAKE, payload, timeout)
                    .await;
                let response = match reply {
                    Ok(reply) if reply.is_empty() => None,
                    Ok(reply) => decode::<HandshakeResponse>(&reply).ok(),
                    Err(e) => {
                        debug!(peer = %peer_id, error = %e, "[CLUSTER] handshake unanswered");
                        None
                    }
                };
                (peer_id, response)
            });
        }

        let mut responses: HashMap<String, Option<HandshakeResponse>> =
            peers.iter().map(|peer| (peer.id.clone(), None)).collect();
        while let Some(joined) = requests.join_next().await {
            match joined {
                Ok((peer_id, response)) => {
                    responses.insert(peer_id, response);
                }
                Err(e) => warn!(error = %e, "[CLUSTER] handshake task failed"),
            }
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::NodeStatus;
    use crate::state::FullState;
    use rtsync_transport::MemoryHub;
    use std::sync::atomic::{AtomicBool, Ordering};

    const PORT: u16 = 7510;

    struct Peer {
        id: String,
        added: std::sync::Mutex<Vec<String>>,
        shutting_down: AtomicBool,
    }

    impl Peer {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                added: std::sync::Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl CommandHandler for Peer {
        async fn full_state(&self) -> Result<FullStateResponse> {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(ClusterError::ShuttingDown);
            }
            Ok(FullStateResponse {
                nodes: vec![NodeStatus {
                    node_id: self.id.clone(),
                    last_message_id: 42,
                }],
                state: FullState::default(),
                activity: vec![],
            })
        }

        async fn add_node(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
            self.added.lock().unwrap().push(request.node_id);
            Ok(HandshakeResponse {
                added: true,
                last_message_id: 42,
            })
        }

        fn is_shutting_down(&self) -> bool {
            self.shutting_down.load(Ordering::SeqCst)
        }

        async fn server_failed(&self, _error: ClusterError) {}
    }

    fn card(id: &str, ip: &str) -> IdCard {
        IdCard::new(id, ip)
    }

    async fn serve(hub: &MemoryHub, peer: &Arc<Peer>, ip: &str) -> CommandServer {
        let handler: Arc<dyn CommandHandler> = peer.clone();
        CommandServer::bind(&hub.network(ip), &endpoint(ip, PORT), Arc::downgrade(&handler))
            .await
            .unwrap()
    }

    fn client(hub: &MemoryHub) -> CommandClient {
        CommandClient::new(
            hub.network("10.0.0.9").requester(),
            PORT,
            Duration::from_secs(5),
            Duration::from_secs(2),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_state_falls_back_round_robin() {
        let hub = MemoryHub::new();
        let peer1 = Peer::new("peer1");
        let peer2 = Peer::new("peer2");
        let _s1 = serve(&hub, &peer1, "10.0.0.1").await;
        let _s2 = serve(&hub, &peer2, "10.0.0.2").await;
        hub.set_unresponsive("10.0.0.1:7510", true);

        let peers = vec![card("peer1", "10.0.0.1"), card("peer2", "10.0.0.2")];
        let state = client(&hub).fetch_full_state(&peers, 0).await.unwrap();

        assert_eq!(state.last_message_id("peer2"), Some(42));
        assert_eq!(
            hub.requests(),
            vec!["10.0.0.1:7510".to_string(), "10.0.0.2:7510".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_state_without_answer_is_none() {
        let hub = MemoryHub::new();
        let peer1 = Peer::new("peer1");
        let _s1 = serve(&hub, &peer1, "10.0.0.1").await;
        hub.set_unresponsive("10.0.0.1:7510", true);

        let peers = vec![card("peer1", "10.0.0.1"), card("ghost", "10.0.0.3")];
        assert!(client(&hub).get_full_state(&peers).await.is_none());
        assert_eq!(hub.requests().len(), 2);
        assert!(client(&hub).get_full_state(&[]).await.is_none());
    }

    #[tokio::test]
    async fn test_errors_while_shutting_down_reply_discarded() {
        let hub = MemoryHub::new();
        let peer1 = Peer::new("peer1");
        let _s1 = serve(&hub, &peer1, "10.0.0.1").await;
        peer1.shutting_down.store(true, Ordering::SeqCst);

        let peers = vec![card("peer1", "10.0.0.1")];
        assert!(client(&hub).fetch_full_state(&peers, 0).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_broadcast_collects_every_peer() {
        let hub = MemoryHub::new();
        let peer1 = Peer::new("peer1");
        let peer2 = Peer::new("peer2");
        let _s1 = serve(&hub, &peer1, "10.0.0.1").await;
        let _s2 = serve(&hub, &peer2, "10.0.0.2").await;
        hub.set_unresponsive("10.0.0.2:7510", true);

        let peers = vec![card("peer1", "10.0.0.1"), card("peer2", "10.0.0.2")];
        let request = HandshakeRequest {
            node_id: "joiner".to_string(),
            ip: "10.0.0.9".to_string(),
            last_message_id: 0,
        };
        let responses = client(&hub).broadcast_handshake(&peers, &request).await.unwrap();

        assert_eq!(responses.len(), 2);
        assert_eq!(
            responses["peer1"],
            Some(HandshakeResponse {
                added: true,
                last_message_id: 42
            })
        );
        assert_eq!(responses["peer2"], None);
        assert_eq!(*peer1.added.lock().unwrap(), vec!["joiner".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_topic_gets_discarded_marker() {
        let hub = MemoryHub::new();
        let peer1 = Peer::new("peer1");
        let _s1 = serve(&hub, &peer1, "10.0.0.1").await;

        let reply = hub
            .network("10.0.0.9")
            .requester()
            .request("10.0.0.1:7510", "reboot", vec![], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reply.is_empty());
    }
}
