//! Distributed lock manager contract.
//!
//! A lock is a lease on a string key (`workflow:<id>`) held by an owner
//! (the engine id). Re-acquisition by the holder extends the lease; an
//! expired lease can be taken by anyone.
//!
//! Follows the same blanket-impl pattern as the executor registry:
//! 1. `DistributedLockManager` uses native async fn in traits
//! 2. Object-safe `LockManagerDyn` returns boxed futures
//! 3. `BoxLockManager` wraps `Arc<dyn LockManagerDyn>` and adds lease
//!    auto-renewal on top of the three primitives

pub mod memory;
pub mod renewal;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

pub use memory::InMemoryLockManager;
pub use renewal::RenewalRegistry;

/// Lock key for a workflow instance.
pub fn workflow_lock_key(instance_id: i64) -> String {
    format!("workflow:{instance_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Lease-based mutual exclusion shared by every engine process.
pub trait DistributedLockManager: Send + Sync {
    /// Take or extend the lease on `key`. Returns `false` when another
    /// owner holds an unexpired lease.
    fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        resource_type: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Release the lease. Returns `false` if `owner` did not hold it.
    fn release_lock(&self, key: &str, owner: &str) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Extend a lease `owner` still holds. Returns `false` if it was lost.
    fn renew_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;
}

/// Object-safe version of [`DistributedLockManager`] with boxed futures.
pub trait LockManagerDyn: Send + Sync {
    fn acquire_lock_boxed<'a>(
        &'a self,
        key: &'a str,
        owner: &'a str,
        resource_type: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + 'a>>;

    fn release_lock_boxed<'a>(
        &'a self,
        key: &'a str,
        owner: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + 'a>>;

    fn renew_lock_boxed<'a>(
        &'a self,
        key: &'a str,
        owner: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + 'a>>;
}

/// Blanket implementation: any `DistributedLockManager` automatically implements `LockManagerDyn`.
impl<T: DistributedLockManager> LockManagerDyn for T {
    fn acquire_lock_boxed<'a>(
        &'a self,
        key: &'a str,
        owner: &'a str,
        resource_type: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + 'a>> {
        Box::pin(self.acquire_lock(key, owner, resource_type, ttl))
    }

    fn release_lock_boxed<'a>(
        &'a self,
        key: &'a str,
        owner: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + 'a>> {
        Box::pin(self.release_lock(key, owner))
    }

    fn renew_lock_boxed<'a>(
        &'a self,
        key: &'a str,
        owner: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LockError>> + Send + 'a>> {
        Box::pin(self.renew_lock(key, owner, ttl))
    }
}

// ---------------------------------------------------------------------------
// BoxLockManager
// ---------------------------------------------------------------------------

/// Type-erased lock manager with auto-renewal.
///
/// Cheap to clone; clones share the backend and the renewal registry.
#[derive(Clone)]
pub struct BoxLockManager {
    inner: Arc<dyn LockManagerDyn>,
    renewals: RenewalRegistry,
    /// Lease duration of each lock acquired through this handle, reused by
    /// auto-renewal.
    ttls: Arc<DashMap<(String, String), Duration>>,
}

impl BoxLockManager {
    pub fn new<L: DistributedLockManager + 'static>(manager: L) -> Self {
        Self {
            inner: Arc::new(manager),
            renewals: RenewalRegistry::new(),
            ttls: Arc::new(DashMap::new()),
        }
    }

    pub async fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        resource_type: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let acquired = self
            .inner
            .acquire_lock_boxed(key, owner, resource_type, ttl)
            .await?;
        if acquired {
            self.ttls.insert((key.to_string(), owner.to_string()), ttl);
        }
        Ok(acquired)
    }

    /// Release the lease and stop its auto-renewal.
    pub async fn release_lock(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        self.disable_auto_renewal(key, owner);
        self.ttls.remove(&(key.to_string(), owner.to_string()));
        self.inner.release_lock_boxed(key, owner).await
    }

    pub async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        self.inner.renew_lock_boxed(key, owner, ttl).await
    }

    /// Renew the lease every `interval` until disabled or lost.
    ///
    /// The lease is extended by the TTL it was acquired with (three
    /// intervals when it was acquired elsewhere).
    pub fn enable_auto_renewal(&self, key: &str, owner: &str, resource_type: &str, interval: Duration) {
        let ttl = self
            .ttls
            .get(&(key.to_string(), owner.to_string()))
            .map(|t| *t)
            .unwrap_or(interval * 3);
        self.renewals
            .spawn(self.inner.clone(), key, owner, resource_type, interval, ttl);
    }

    pub fn disable_auto_renewal(&self, key: &str, owner: &str) {
        self.renewals.cancel(key, owner);
    }

    pub fn is_auto_renewing(&self, key: &str, owner: &str) -> bool {
        self.renewals.contains(key, owner)
    }

    /// Stop every renewal task.
    pub fn disable_all_renewals(&self) {
        self.renewals.cancel_all();
    }
}

impl std::fmt::Debug for BoxLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxLockManager")
            .field("renewals", &self.renewals.len())
            .finish()
    }
}
