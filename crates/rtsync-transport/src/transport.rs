//! Abstract transport layer for cluster synchronization.
//!
//! This module defines the socket traits the cluster core depends on, so
//! that the TCP sockets and the in-process simulation are interchangeable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::pubsub::{TcpPublisher, TcpSubscriber};
use crate::reqrep::{ReplyServer, TcpRequester};
use crate::tcp::{TcpTransport, TcpTransportConfig};

/// Outbound broadcast socket: every connected subscriber receives every message.
#[async_trait]
pub trait SyncSink: Send + Sync {
    /// Broadcast one message. Resolves once the message has been handed to the wire.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Close the socket and drop every subscriber connection.
    async fn close(&self);

    /// Drop every subscriber connected from `host`.
    async fn disconnect(&self, host: &str);

    /// Address the socket is bound to.
    fn local_addr(&self) -> String;
}

/// Inbound side of a broadcast socket, connected to one remote publisher.
///
/// Dropping the source closes it.
#[async_trait]
pub trait SyncSource: Send {
    /// Next `(topic, payload)` in arrival order, or `None` once the source is exhausted.
    async fn recv(&mut self) -> Option<(String, Vec<u8>)>;
}

/// Server-side request handler. Returning `None` replies with the discarded marker.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a request and produce the reply payload.
    async fn handle(&self, topic: &str, payload: Vec<u8>) -> Option<Vec<u8>>;
}

/// A bound request/reply server.
#[async_trait]
pub trait CommandEndpoint: Send + Sync {
    /// Stop accepting requests.
    async fn close(&self);

    /// Resolves when the serve loop stops: `Ok` after `close`, `Err` if it failed.
    async fn wait(&self) -> Result<()>;

    /// Address the server is bound to.
    fn local_addr(&self) -> String;
}

/// Client side of the request/reply channel.
#[async_trait]
pub trait Requester: Send + Sync {
    /// Send one request and wait at most `timeout` for its reply.
    async fn request(
        &self,
        addr: &str,
        topic: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>>;
}

/// Factory for every socket a node needs.
#[async_trait]
pub trait Network: Send + Sync {
    /// Bind the broadcast-publish endpoint.
    async fn bind_publisher(&self, addr: &str) -> Result<Arc<dyn SyncSink>>;

    /// Connect to a remote broadcast-publish endpoint.
    async fn subscribe(&self, addr: &str) -> Result<Box<dyn SyncSource>>;

    /// Bind the request-reply endpoint.
    async fn bind_command(
        &self,
        addr: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn CommandEndpoint>>;

    /// Client used to reach remote request-reply endpoints.
    fn requester(&self) -> Arc<dyn Requester>;
}

// ============================================================================
// TCP Network Implementation
// ============================================================================

/// TCP implementation of [`Network`].
#[derive(Debug, Clone, Default)]
pub struct TcpNetwork {
    transport: TcpTransport,
}

impl TcpNetwork {
    /// Creates a TCP network with the given socket configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            transport: TcpTransport::new(config),
        }
    }
}

#[async_trait]
impl Network for TcpNetwork {
    async fn bind_publisher(&self, addr: &str) -> Result<Arc<dyn SyncSink>> {
        let publisher = TcpPublisher::bind(self.transport.clone(), addr).await?;
        Ok(Arc::new(publisher))
    }

    async fn subscribe(&self, addr: &str) -> Result<Box<dyn SyncSource>> {
        let subscriber = TcpSubscriber::connect(self.transport.clone(), addr).await;
        Ok(Box::new(subscriber))
    }

    async fn bind_command(
        &self,
        addr: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn CommandEndpoint>> {
        let server = ReplyServer::bind(self.transport.clone(), addr, handler).await?;
        Ok(Arc::new(server))
    }

    fn requester(&self) -> Arc<dyn Requester> {
        Arc::new(TcpRequester::new(self.transport.clone()))
    }
}
