//! Single-process lock manager backed by a `DashMap` of leases.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{DistributedLockManager, LockError};

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    resource_type: String,
    expires_at: Instant,
}

impl Lease {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Lease table for a single engine process (tests, embedded use).
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    leases: DashMap<String, Lease>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of an unexpired lease on `key`.
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.leases
            .get(key)
            .filter(|lease| !lease.is_expired(now))
            .map(|lease| lease.owner.clone())
    }

    /// Resource type recorded with the lease on `key`.
    pub fn resource_type(&self, key: &str) -> Option<String> {
        self.leases.get(key).map(|lease| lease.resource_type.clone())
    }
}

impl DistributedLockManager for InMemoryLockManager {
    async fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        resource_type: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let lease = Lease {
            owner: owner.to_string(),
            resource_type: resource_type.to_string(),
            expires_at: now + ttl,
        };
        match self.leases.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(lease);
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.owner == owner || current.is_expired(now) {
                    slot.insert(lease);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.owner == owner)
            .is_some())
    }

    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        match self.leases.get_mut(key) {
            Some(mut lease) if lease.owner == owner && !lease.is_expired(now) => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
