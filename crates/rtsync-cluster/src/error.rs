//! Error types for the cluster subsystem.

use rtsync_transport::TransportError;
use thiserror::Error;

/// Errors that can occur while keeping the cluster synchronized.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A replication invariant was violated; the local state can no longer be trusted.
    #[error("desync: {msg}")]
    Desync {
        /// What went wrong.
        msg: String,
    },

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An operation did not complete in time.
    #[error("{what} timed out after {timeout_ms}ms")]
    Timeout {
        /// The operation that timed out.
        what: String,
        /// The limit that was exceeded.
        timeout_ms: u64,
    },

    /// None of the contacted peers answered.
    #[error("no peer answered the {what} request")]
    NoPeerAnswer {
        /// The request that went unanswered.
        what: String,
    },

    /// This node believes it is cut off from the rest of the cluster.
    #[error("network partition suspected: {msg}")]
    PartitionSuspected {
        /// Why a partition is suspected.
        msg: String,
    },

    /// A remote node sent something this node cannot interpret.
    #[error("protocol violation from {node_id}: {msg}")]
    ProtocolViolation {
        /// The offending node.
        node_id: String,
        /// Description of the violation.
        msg: String,
    },

    /// Invalid or unusable configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// What is wrong with the configuration.
        msg: String,
    },

    /// Distributed lock misuse or failure.
    #[error("mutex {name}: {msg}")]
    Mutex {
        /// Lock name.
        name: String,
        /// Description of the failure.
        msg: String,
    },

    /// A collaborator (key-value store, plugin registry, ...) failed.
    #[error("{collaborator} error: {msg}")]
    Collaborator {
        /// Which collaborator failed.
        collaborator: &'static str,
        /// Error message reported by the collaborator.
        msg: String,
    },

    /// Binary wire encoding failed.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// JSON encoding of a stored record failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The node is shutting down.
    #[error("node is shutting down")]
    ShuttingDown,

    /// The node has no ID card yet and cannot publish changes.
    #[error("node has not joined the cluster")]
    NotJoined,
}

impl ClusterError {
    /// Shorthand for a [`ClusterError::Desync`].
    pub fn desync(msg: impl Into<String>) -> Self {
        ClusterError::Desync { msg: msg.into() }
    }

    /// True for errors that make the local replicated state untrustworthy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::Desync { .. } | ClusterError::PartitionSuspected { .. }
        )
    }
}

/// Result alias for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(ClusterError::desync("gap").is_fatal());
        assert!(ClusterError::PartitionSuspected {
            msg: "card expired".to_string()
        }
        .is_fatal());
        assert!(!ClusterError::Collaborator {
            collaborator: "kv",
            msg: "connection reset".to_string()
        }
        .is_fatal());
        assert!(!ClusterError::NotJoined.is_fatal());
    }
}
