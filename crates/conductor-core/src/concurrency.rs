//! Concurrency control: bounded slot pools per resource class.
//!
//! Each class (`workflow`, `node`) is a tokio `Semaphore`. A slot is owned
//! by an integer id (workflow instance id or node instance id); the permit
//! lives in a `DashMap` until the owner releases it, so a slot can be
//! released from a different task than the one that acquired it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::workflow::error::EngineError;

/// Resource class a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Workflow,
    Node,
}

impl ResourceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceClass::Workflow => "workflow",
            ResourceClass::Node => "node",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time usage of one slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub class: ResourceClass,
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
}

struct Pool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Process-local admission control.
pub struct ConcurrencyManager {
    workflow: Pool,
    node: Pool,
    held: DashMap<(ResourceClass, i64), OwnedSemaphorePermit>,
}

impl ConcurrencyManager {
    pub fn new(max_workflows: usize, max_nodes: usize) -> Self {
        let pool = |capacity: usize| Pool {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
        };
        Self {
            workflow: pool(max_workflows),
            node: pool(max_nodes),
            held: DashMap::new(),
        }
    }

    fn pool(&self, class: ResourceClass) -> &Pool {
        match class {
            ResourceClass::Workflow => &self.workflow,
            ResourceClass::Node => &self.node,
        }
    }

    /// Take a slot without waiting.
    ///
    /// Idempotent per `(class, owner)`: an owner already holding a slot
    /// succeeds without taking a second one.
    pub fn request_slot(&self, class: ResourceClass, owner: i64) -> Result<(), EngineError> {
        if self.held.contains_key(&(class, owner)) {
            return Ok(());
        }
        let permit = self
            .pool(class)
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::ResourceExhausted(class))?;
        self.held.insert((class, owner), permit);
        tracing::debug!(class = %class, owner, "slot acquired");
        Ok(())
    }

    /// Take a slot, waiting up to `timeout` for one to free up.
    pub async fn acquire_slot(
        &self,
        class: ResourceClass,
        owner: i64,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        if self.held.contains_key(&(class, owner)) {
            return Ok(());
        }
        let semaphore = self.pool(class).semaphore.clone();
        let permit = match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(EngineError::ShuttingDown),
            Err(_elapsed) => {
                return Err(EngineError::Timeout(format!(
                    "no {class} slot available within {}ms",
                    timeout.as_millis()
                )));
            }
        };
        self.held.insert((class, owner), permit);
        tracing::debug!(class = %class, owner, "slot acquired");
        Ok(())
    }

    /// Release the slot held by `owner`. Returns `false` if none was held.
    pub fn release_slot(&self, class: ResourceClass, owner: i64) -> bool {
        let released = self.held.remove(&(class, owner)).is_some();
        if released {
            tracing::debug!(class = %class, owner, "slot released");
        }
        released
    }

    pub fn holds(&self, class: ResourceClass, owner: i64) -> bool {
        self.held.contains_key(&(class, owner))
    }

    /// Owners currently holding a slot of `class`.
    pub fn owners(&self, class: ResourceClass) -> Vec<i64> {
        let mut owners: Vec<i64> = self
            .held
            .iter()
            .filter(|e| e.key().0 == class)
            .map(|e| e.key().1)
            .collect();
        owners.sort_unstable();
        owners
    }

    pub fn stats(&self) -> [SlotStats; 2] {
        [
            self.class_stats(ResourceClass::Workflow),
            self.class_stats(ResourceClass::Node),
        ]
    }

    pub fn class_stats(&self, class: ResourceClass) -> SlotStats {
        let pool = self.pool(class);
        let available = pool.semaphore.available_permits();
        SlotStats {
            class,
            capacity: pool.capacity,
            available,
            in_use: pool.capacity.saturating_sub(available),
        }
    }

    /// Drop every held permit.
    pub fn release_all(&self) {
        self.held.clear();
    }

    /// Release `owner`'s slot when the returned guard is dropped.
    pub fn release_on_drop(&self, class: ResourceClass, owner: i64) -> SlotGuard<'_> {
        SlotGuard {
            manager: self,
            class,
            owner,
        }
    }
}

/// Releases a held slot on drop, including when the holding future is
/// cancelled.
pub struct SlotGuard<'a> {
    manager: &'a ConcurrencyManager,
    class: ResourceClass,
    owner: i64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.manager.release_slot(self.class, self.owner);
    }
}

impl fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_slot_is_bounded_and_idempotent() {
        let mgr = ConcurrencyManager::new(2, 1);
        mgr.request_slot(ResourceClass::Workflow, 1).unwrap();
        mgr.request_slot(ResourceClass::Workflow, 1).unwrap();
        mgr.request_slot(ResourceClass::Workflow, 2).unwrap();

        let err = mgr.request_slot(ResourceClass::Workflow, 3).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted(ResourceClass::Workflow)));

        let stats = mgr.class_stats(ResourceClass::Workflow);
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.available, 0);
        assert_eq!(mgr.owners(ResourceClass::Workflow), vec![1, 2]);
    }

    #[test]
    fn release_frees_the_slot() {
        let mgr = ConcurrencyManager::new(1, 1);
        mgr.request_slot(ResourceClass::Workflow, 1).unwrap();
        assert!(mgr.release_slot(ResourceClass::Workflow, 1));
        assert!(!mgr.release_slot(ResourceClass::Workflow, 1));
        mgr.request_slot(ResourceClass::Workflow, 2).unwrap();
    }

    #[test]
    fn classes_are_independent() {
        let mgr = ConcurrencyManager::new(1, 1);
        mgr.request_slot(ResourceClass::Workflow, 7).unwrap();
        mgr.request_slot(ResourceClass::Node, 7).unwrap();
        assert!(mgr.holds(ResourceClass::Node, 7));
        assert_eq!(mgr.class_stats(ResourceClass::Node).in_use, 1);
    }

    #[tokio::test]
    async fn acquire_slot_waits_then_times_out() {
        let mgr = Arc::new(ConcurrencyManager::new(1, 1));
        mgr.request_slot(ResourceClass::Node, 1).unwrap();

        let err = mgr
            .acquire_slot(ResourceClass::Node, 2, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.acquire_slot(ResourceClass::Node, 2, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.release_slot(ResourceClass::Node, 1);
        waiter.await.unwrap().unwrap();
        assert!(mgr.holds(ResourceClass::Node, 2));
    }

    #[test]
    fn guard_releases_on_drop() {
        let mgr = ConcurrencyManager::new(1, 1);
        mgr.request_slot(ResourceClass::Node, 3).unwrap();
        {
            let _guard = mgr.release_on_drop(ResourceClass::Node, 3);
            assert!(mgr.holds(ResourceClass::Node, 3));
        }
        assert!(!mgr.holds(ResourceClass::Node, 3));
        assert_eq!(mgr.class_stats(ResourceClass::Node).available, 1);
    }
}
