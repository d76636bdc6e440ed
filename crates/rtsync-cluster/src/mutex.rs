//! Distributed mutex backed by the shared key-value store.
//!
//! A lock is a key set-if-absent with a unique value and a ttl. Releasing
//! deletes the key only if it still holds that value, so a node whose lock
//! expired and was taken over never releases somebody else's lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::bus::KvStore;
use crate::error::{ClusterError, Result};

const KEY_PREFIX: &str = "cluster:mutex:";

/// How long [`Mutex::lock`] keeps trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Retry until the lock is acquired.
    Forever,
    /// A single attempt.
    Once,
    /// Retry until the duration has elapsed.
    Timeout(Duration),
}

/// One instance of a named distributed lock.
pub struct Mutex {
    kv: Arc<dyn KvStore>,
    name: String,
    key: String,
    value: String,
    poll: Duration,
    locked: bool,
}

impl Mutex {
    /// Create an unlocked instance; `poll` is the delay between two attempts.
    pub fn new(kv: Arc<dyn KvStore>, name: &str, poll: Duration) -> Self {
        Self {
            kv,
            name: name.to_string(),
            key: format!("{}{}", KEY_PREFIX, name),
            value: Uuid::new_v4().to_string(),
            poll,
            locked: false,
        }
    }

    /// Lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this instance holds the lock (as far as it knows; the ttl may have run out).
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Try to acquire the lock. Returns whether it was acquired.
    pub async fn lock(&mut self, ttl: Duration, wait: LockWait) -> Result<bool> {
        if self.locked {
            return Err(ClusterError::Mutex {
                name: self.name.clone(),
                msg: "already locked by this instance".to_string(),
            });
        }

        let deadline = match wait {
            LockWait::Timeout(limit) => Some(Instant::now() + limit),
            _ => None,
        };

        loop {
            if self.kv.set_if_absent(&self.key, &self.value, Some(ttl)).await? {
                self.locked = true;
                debug!(name = %self.name, "[CLUSTER] mutex acquired");
                return Ok(true);
            }

            match wait {
                LockWait::Once => return Ok(false),
                LockWait::Timeout(_) => {
                    if deadline.map_or(false, |at| Instant::now() + self.poll > at) {
                        return Ok(false);
                    }
                }
                LockWait::Forever => {}
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Release the lock if this instance still owns it.
    pub async fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Err(ClusterError::Mutex {
                name: self.name.clone(),
                msg: "unlock called without a successful lock".to_string(),
            });
        }
        self.locked = false;
        if !self.kv.delete_if_equals(&self.key, &self.value).await? {
            debug!(name = %self.name, "[CLUSTER] mutex expired before release");
        }
        Ok(())
    }
}
