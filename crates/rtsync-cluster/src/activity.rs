//! Bounded log of cluster membership changes, for operators.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Membership change kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityEvent {
    /// A node joined the cluster.
    Joined,
    /// A node was removed from the cluster.
    Evicted,
}

/// One membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Node concerned.
    pub node_id: String,
    /// Address of that node.
    pub address: String,
    /// What happened.
    pub event: ActivityEvent,
    /// Why, when known.
    pub reason: Option<String>,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
}

/// FIFO of the latest [`ActivityEntry`]s; the oldest entry is dropped on overflow.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    depth: usize,
    entries: VecDeque<ActivityEntry>,
}

impl ActivityLog {
    /// Create an empty log keeping at most `depth` entries.
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            entries: VecDeque::with_capacity(depth.max(1)),
        }
    }

    /// Record a change.
    pub fn record(
        &mut self,
        node_id: &str,
        address: &str,
        event: ActivityEvent,
        reason: Option<&str>,
    ) {
        self.push(ActivityEntry {
            node_id: node_id.to_string(),
            address: address.to_string(),
            event,
            reason: reason.map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    fn push(&mut self, entry: ActivityEntry) {
        while self.entries.len() >= self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Replace the content with entries received from another node, keeping the newest ones.
    pub fn adopt(&mut self, entries: Vec<ActivityEntry>) {
        self.entries.clear();
        for entry in entries {
            self.push(entry);
        }
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
