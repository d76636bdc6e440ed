//! Request/reply sockets over TCP.
//!
//! The server answers every request with exactly one reply frame; a handler
//! that has nothing to say produces the empty discarded-request marker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameKind};
use crate::tcp::{TcpConnection, TcpTransport};
use crate::transport::{CommandEndpoint, RequestHandler, Requester};

/// Request-reply server bound to one address.
pub struct ReplyServer {
    local_addr: String,
    cancel: CancellationToken,
    serve_loop: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ReplyServer {
    /// Bind and start serving requests with `handler`.
    pub async fn bind(
        transport: TcpTransport,
        addr: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self> {
        let listener = transport.listen(addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        let cancel = CancellationToken::new();
        let serve_loop = tokio::spawn(serve(transport, listener, handler, cancel.clone()));

        debug!(addr = %local_addr, "reply server bound");
        Ok(Self {
            local_addr,
            cancel,
            serve_loop: Mutex::new(Some(serve_loop)),
        })
    }
}

async fn serve(
    transport: TcpTransport,
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = transport.accept(&listener) => accepted,
        };
        let conn = match accepted {
            Ok(conn) => conn,
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        };
        let handler = Arc::clone(&handler);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = serve_connection(conn, handler) => {}
            }
        });
    }
}

async fn serve_connection(conn: TcpConnection, handler: Arc<dyn RequestHandler>) {
    loop {
        let frame = match conn.recv_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = conn.peer_addr(), error = %e, "request connection closed");
                return;
            }
        };

        let reply = if frame.kind == FrameKind::Request {
            match handler.handle(&frame.topic, frame.payload).await {
                Some(payload) => Frame::new(FrameKind::Reply, frame.topic, payload),
                None => Frame::discarded(frame.topic),
            }
        } else {
            warn!(peer = conn.peer_addr(), kind = ?frame.kind, "unexpected frame on request socket");
            Frame::discarded(frame.topic)
        };

        if let Err(e) = conn.send_frame(&reply).await {
            warn!(peer = conn.peer_addr(), error = %e, "failed to send reply");
            return;
        }
    }
}

#[async_trait]
impl CommandEndpoint for ReplyServer {
    async fn close(&self) {
        self.cancel.cancel();
    }

    async fn wait(&self) -> Result<()> {
        let handle = self.serve_loop.lock().await.take();
        match handle {
            Some(handle) => handle.await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

/// Request client opening one connection per request.
#[derive(Debug, Clone, Default)]
pub struct TcpRequester {
    transport: TcpTransport,
}

impl TcpRequester {
    /// Create a requester on top of `transport`.
    pub fn new(transport: TcpTransport) -> Self {
        Self { transport }
    }

    async fn exchange(&self, addr: &str, frame: Frame, timeout: Duration) -> Result<Vec<u8>> {
        let conn = self.transport.connect_within(addr, timeout).await?;
        conn.send_frame(&frame).await?;
        let reply = conn.recv_frame().await?;
        if reply.kind != FrameKind::Reply {
            return Err(TransportError::InvalidFrame {
                reason: format!("expected a reply, got {:?}", reply.kind),
            });
        }
        Ok(reply.payload)
    }
}

#[async_trait]
impl Requester for TcpRequester {
    async fn request(
        &self,
        addr: &str,
        topic: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let frame = Frame::new(FrameKind::Request, topic, payload);
        tokio::time::timeout(timeout, self.exchange(addr, frame, timeout))
            .await
            .map_err(|_| TransportError::RequestTimeout {
                addr: addr.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, topic: &str, payload: Vec<u8>) -> Option<Vec<u8>> {
            match topic {
                "echo" => Some(payload),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Some(payload)
                }
                _ => None,
            }
        }
    }

    async fn start() -> ReplyServer {
        ReplyServer::bind(TcpTransport::default(), "127.0.0.1:0", Arc::new(EchoHandler))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let server = start().await;
        let requester = TcpRequester::default();
        let reply = requester
            .request(&server.local_addr(), "echo", b"hello".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"hello");
        server.close().await;
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_topic_gets_discarded_marker() {
        let server = start().await;
        let reply = TcpRequester::default()
            .request(&server.local_addr(), "what", b"x".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let server = start().await;
        let result = TcpRequester::default()
            .request(&server.local_addr(), "slow", vec![], Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::RequestTimeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_after_close_is_ok() {
        let server = start().await;
        server.close().await;
        assert!(server.wait().await.is_ok());
        assert!(server.wait().await.is_ok());
    }
}
