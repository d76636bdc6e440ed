#![warn(missing_docs)]

//! rtsync transport subsystem: framed TCP publish/subscribe and request/reply sockets

pub mod error;
pub mod memory;
pub mod protocol;
pub mod pubsub;
pub mod reqrep;
pub mod tcp;
pub mod transport;

pub use error::{Result, TransportError};
pub use memory::{MemoryHub, MemoryNetwork};
pub use transport::{
    CommandEndpoint, Network, RequestHandler, Requester, SyncSink, SyncSource, TcpNetwork,
};
