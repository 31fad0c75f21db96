//! Background lease renewal.
//!
//! One task per `(key, owner)`, each sleeping `interval` between renewals
//! and stopped through its own `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LockManagerDyn;

/// Tracks running renewal tasks.
#[derive(Clone, Default)]
pub struct RenewalRegistry {
    tasks: Arc<DashMap<(String, String), CancellationToken>>,
}

impl RenewalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start renewing `key` for `owner`. Replaces an existing renewal task.
    pub fn spawn(
        &self,
        manager: Arc<dyn LockManagerDyn>,
        key: &str,
        owner: &str,
        resource_type: &str,
        interval: Duration,
        ttl: Duration,
    ) {
        let token = CancellationToken::new();
        let entry = (key.to_string(), owner.to_string());
        if let Some(previous) = self.tasks.insert(entry.clone(), token.clone()) {
            previous.cancel();
        }

        let tasks = self.tasks.clone();
        let key = key.to_string();
        let owner = owner.to_string();
        let resource_type = resource_type.to_string();
        tokio::spawn(async move {
            debug!(%key, %owner, %resource_type, ?interval, "lock auto-renewal started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match manager.renew_lock_boxed(&key, &owner, ttl).await {
                    Ok(true) => debug!(%key, %owner, "lock renewed"),
                    Ok(false) => {
                        warn!(%key, %owner, "lock lost before renewal; stopping auto-renewal");
                        break;
                    }
                    Err(err) => warn!(%key, %owner, error = %err, "failed to renew lock"),
                }
            }
            // A replacement task may own the entry now; its token is live.
            token.cancel();
            tasks.remove_if(&entry, |_, t| t.is_cancelled());
            info!(%key, %owner, "lock auto-renewal stopped");
        });
    }

    pub fn cancel(&self, key: &str, owner: &str) {
        if let Some((_, token)) = self.tasks.remove(&(key.to_string(), owner.to_string())) {
            token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.tasks.iter() {
            entry.value().cancel();
        }
        self.tasks.clear();
    }

    pub fn contains(&self, key: &str, owner: &str) -> bool {
        self.tasks.contains_key(&(key.to_string(), owner.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
