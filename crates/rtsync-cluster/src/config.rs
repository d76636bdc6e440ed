//! Cluster configuration.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

/// Longest accepted heartbeat period.
const MAX_HEARTBEAT_MS: u64 = 3_600_000;

/// TCP ports used by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Request/reply endpoint (full state, handshake).
    pub command: u16,
    /// Broadcast endpoint for sync messages.
    pub sync: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            command: 7510,
            sync: 7511,
        }
    }
}

/// Address family a node announces itself with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    /// IPv4 addresses only.
    Ipv4,
    /// IPv6 addresses only.
    Ipv6,
}

/// How a node picks the address it binds to and announces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpPolicy {
    /// Address family to use.
    pub family: IpFamily,
    /// Explicit address; skips discovery when set.
    pub address: Option<IpAddr>,
    /// Prefer private (RFC 1918 / unique local) addresses over public ones.
    pub private: bool,
    /// Remote address used to discover the outward-facing local interface.
    /// Nothing is sent to it.
    pub route_target: String,
}

impl Default for IpPolicy {
    fn default() -> Self {
        Self {
            family: IpFamily::Ipv4,
            address: None,
            private: true,
            route_target: "10.255.255.255:1".to_string(),
        }
    }
}

/// Configuration of the cluster synchronization core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Heartbeat period in milliseconds.
    pub heartbeat_ms: u64,
    /// Maximum time a node may spend joining the cluster.
    pub join_timeout_ms: u64,
    /// Number of nodes required before serving requests.
    pub min_nodes: usize,
    /// Number of entries kept in the activity log.
    pub activity_depth: usize,
    /// Ports.
    pub ports: PortsConfig,
    /// Address selection.
    pub ip: IpPolicy,
    /// Timeout of a full-state request to one peer.
    pub command_timeout_ms: u64,
    /// Timeout of a handshake request to one peer; defaults to the heartbeat.
    pub handshake_timeout_ms: Option<u64>,
    /// Interval between two distributed lock attempts.
    pub lock_poll_ms: u64,
    /// Time-to-live of an ID card; defaults to three heartbeats.
    pub idcard_ttl_ms: Option<u64>,
    /// Delay before each split-brain check pass; defaults to two heartbeat checks.
    pub consistency_delay_ms: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 2000,
            join_timeout_ms: 60_000,
            min_nodes: 1,
            activity_depth: 50,
            ports: PortsConfig::default(),
            ip: IpPolicy::default(),
            command_timeout_ms: 5000,
            handshake_timeout_ms: None,
            lock_poll_ms: 200,
            idcard_ttl_ms: None,
            consistency_delay_ms: None,
        }
    }
}

impl ClusterConfig {
    /// Load a configuration file; the format is chosen from the extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ClusterError::Config {
            msg: format!("cannot read {}: {}", path.display(), e),
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ClusterConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ClusterError::Config {
                msg: format!("invalid TOML in {}: {}", path.display(), e),
            })?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(ClusterError::Config {
                    msg: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the cluster cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| {
            Err(ClusterError::Config {
                msg: msg.to_string(),
            })
        };
        if self.heartbeat_ms == 0 {
            return fail("heartbeat_ms must be greater than 0");
        }
        if self.heartbeat_ms > MAX_HEARTBEAT_MS {
            return fail("heartbeat_ms must not exceed one hour");
        }
        if self.min_nodes == 0 {
            return fail("min_nodes must be at least 1");
        }
        if self.activity_depth == 0 {
            return fail("activity_depth must be at least 1");
        }
        if self.ports.command == self.ports.sync {
            return fail("command and sync ports must differ");
        }
        if self.join_timeout_ms < self.heartbeat_ms {
            return fail("join_timeout_ms must be at least one heartbeat");
        }
        if self.lock_poll_ms == 0 {
            return fail("lock_poll_ms must be greater than 0");
        }
        Ok(())
    }

    /// Heartbeat period.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Time without any message after which a remote node is suspected.
    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.saturating_mul(3) / 2)
    }

    /// Overall bootstrap limit.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Full-state request timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Handshake request timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.unwrap_or(self.heartbeat_ms))
    }

    /// Distributed lock retry interval.
    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_ms)
    }

    /// ID card time-to-live.
    pub fn idcard_ttl(&self) -> Duration {
        Duration::from_millis(self.idcard_ttl_ms.unwrap_or(self.heartbeat_ms.saturating_mul(3)))
    }

    /// Time left for topologies to settle before a split-brain check pass.
    ///
    /// The default covers two heartbeat checks, long enough for every node
    /// to notice the same heartbeat loss.
    pub fn consistency_delay(&self) -> Duration {
        match self.consistency_delay_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.heartbeat_check_interval() * 2,
        }
    }
}
