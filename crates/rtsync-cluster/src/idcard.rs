//! Node identity cards.
//!
//! Every node publishes an [`IdCard`] in the shared key-value store and keeps
//! refreshing its ttl. A card that disappears means its node died or was
//! evicted. The card also carries the node's topology: the remote nodes it
//! currently considers alive, which split-brain arbitration relies on.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::bus::KvStore;
use crate::error::{ClusterError, Result};

const KEY_PREFIX: &str = "cluster:idcard:";

/// Identity of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCard {
    /// Node identifier.
    pub id: String,
    /// Address the node binds its sockets to.
    pub ip: String,
    /// Creation time, milliseconds since the epoch.
    pub birthdate: i64,
    /// Remote nodes this node believes are alive.
    pub topology: BTreeSet<String>,
}

impl IdCard {
    /// Build a card born now.
    pub fn new(id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            birthdate: Utc::now().timestamp_millis(),
            topology: BTreeSet::new(),
        }
    }
}

/// Shared registry of ID cards.
#[async_trait]
pub trait IdCardStore: Send + Sync {
    /// Create and publish this node's card under a fresh unique id.
    async fn create(&self, ip: &str) -> Result<IdCard>;

    /// This node's card, once created.
    fn card(&self) -> Option<IdCard>;

    /// Re-publish this node's card and extend its ttl.
    /// Fails if the card expired or was removed in the meantime.
    async fn refresh(&self) -> Result<()>;

    /// Add a remote node to this node's topology.
    async fn add_node(&self, node_id: &str) -> Result<()>;

    /// Remove a remote node from this node's topology.
    async fn remove_node(&self, node_id: &str) -> Result<()>;

    /// Delete this node's own card.
    async fn dispose(&self) -> Result<()>;

    /// Every card in the store except this node's.
    async fn remote_cards(&self) -> Result<Vec<IdCard>>;
}

/// [`IdCardStore`] on top of a [`KvStore`], cards encoded as JSON.
pub struct KvIdCardStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    card: Mutex<Option<IdCard>>,
}

impl KvIdCardStore {
    /// Create a store whose cards expire after `ttl` without refresh.
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            kv,
            ttl,
            card: Mutex::new(None),
        }
    }

    fn key(node_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, node_id)
    }

    fn own(&self) -> std::sync::MutexGuard<'_, Option<IdCard>> {
        self.card.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn own_card(&self) -> Result<IdCard> {
        self.own().clone().ok_or_else(|| ClusterError::Collaborator {
            collaborator: "idcard",
            msg: "ID card not created yet".to_string(),
        })
    }

    async fn save(&self, card: &IdCard) -> Result<()> {
        let encoded = serde_json::to_string(card)?;
        if !self
            .kv
            .set_if_present(&Self::key(&card.id), &encoded, Some(self.ttl))
            .await?
        {
            return Err(ClusterError::PartitionSuspected {
                msg: format!("ID card of {} expired before it could be refreshed", card.id),
            });
        }
        Ok(())
    }

    async fn update_topology(&self, update: impl FnOnce(&mut BTreeSet<String>)) -> Result<()> {
        let card = {
            let mut own = self.own();
            let card = own.as_mut().ok_or_else(|| ClusterError::Collaborator {
                collaborator: "idcard",
                msg: "ID card not created yet".to_string(),
            })?;
            update(&mut card.topology);
            card.clone()
        };
        self.save(&card).await
    }

    /// Fetch any card by node id.
    pub async fn get(&self, node_id: &str) -> Result<Option<IdCard>> {
        match self.kv.get(&Self::key(node_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl IdCardStore for KvIdCardStore {
    async fn create(&self, ip: &str) -> Result<IdCard> {
        loop {
            let id = format!("node-{}", &Uuid::new_v4().simple().to_string()[..12]);
            let card = IdCard::new(id, ip);
            let encoded = serde_json::to_string(&card)?;
            if self
                .kv
                .set_if_absent(&Self::key(&card.id), &encoded, Some(self.ttl))
                .await?
            {
                debug!(node_id = %card.id, ip, "[CLUSTER] ID card created");
                *self.own() = Some(card.clone());
                return Ok(card);
            }
        }
    }

    fn card(&self) -> Option<IdCard> {
        self.own().clone()
    }

    async fn refresh(&self) -> Result<()> {
        let card = self.own_card()?;
        self.save(&card).await
    }

    async fn add_node(&self, node_id: &str) -> Result<()> {
        self.update_topology(|topology| {
            topology.insert(node_id.to_string());
        })
        .await
    }

    async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.update_topology(|topology| {
            topology.remove(node_id);
        })
        .await
    }

    async fn dispose(&self) -> Result<()> {
        let card = self.own().take();
        if let Some(card) = card {
            self.kv.delete(&Self::key(&card.id)).await?;
        }
        Ok(())
    }

    async fn remote_cards(&self) -> Result<Vec<IdCard>> {
        let own_id = self.own().as_ref().map(|card| card.id.clone());
        let mut cards = Vec::new();
        for key in self.kv.keys(KEY_PREFIX).await? {
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            let card: IdCard = serde_json::from_str(&raw)?;
            if Some(&card.id) != own_id.as_ref() {
                cards.push(card);
            }
        }
        Ok(cards)
    }
}
