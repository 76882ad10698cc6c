//! Per-account ownership leases in the shared store.

use std::{sync::Arc, time::Duration};

use anyhow::Result;

use crate::{config::KeySpace, store::CoordinationStore};

/// A lease is a `lock:<account>` key holding the owning instance id, with a
/// TTL. Every write is conditional on that owner value.
pub struct LeaseManager {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    instance_id: String,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeySpace,
        instance_id: String,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            instance_id,
            ttl,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `false` when another instance (or an earlier run of this one) holds it.
    pub async fn acquire(&self, account: &str) -> Result<bool> {
        self.store
            .set_if_absent(&self.keys.lease_key(account), &self.instance_id, self.ttl)
            .await
    }

    /// Extend the TTL only while this instance is still the owner.
    pub async fn renew(&self, account: &str) -> Result<bool> {
        self.store
            .expire_if_equals(&self.keys.lease_key(account), &self.instance_id, self.ttl)
            .await
    }

    /// Delete the lease only while this instance is still the owner.
    pub async fn release(&self, account: &str) -> Result<bool> {
        self.store
            .delete_if_equals(&self.keys.lease_key(account), &self.instance_id)
            .await
    }

    pub async fn owner(&self, account: &str) -> Result<Option<String>> {
        self.store.get(&self.keys.lease_key(account)).await
    }
}
