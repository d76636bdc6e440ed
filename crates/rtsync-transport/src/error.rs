//! Error types for the transport subsystem.

use thiserror::Error;

/// Errors raised by sockets and framing.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused to {addr}")]
    ConnectionRefused { addr: String },

    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u32, max_size: u32 },

    #[error("request to {addr} timed out after {timeout_ms}ms")]
    RequestTimeout { addr: String, timeout_ms: u64 },

    #[error("address already bound: {addr}")]
    AddressInUse { addr: String },

    #[error("socket closed")]
    Closed,

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
