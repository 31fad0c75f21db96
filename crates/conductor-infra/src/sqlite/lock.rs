//! SQLite lease table implementing `DistributedLockManager`.
//!
//! Every engine process pointed at the same database file shares the
//! `distributed_locks` table. Acquisition is a single conditional upsert:
//! the row is written only when it is absent, already held by the caller,
//! or past its expiry, so two owners can never both see `rows_affected = 1`.

use std::time::Duration;

use chrono::Utc;
use conductor_core::lock::{DistributedLockManager, LockError};

use super::pool::DatabasePool;

/// SQLite-backed lock manager.
#[derive(Debug, Clone)]
pub struct SqliteLockManager {
    pool: DatabasePool,
}

impl SqliteLockManager {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Current holder of an unexpired lease on `key`.
    pub async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT owner FROM distributed_locks WHERE lock_key = ? AND expires_at > ?")
                .bind(key)
                .bind(now_millis())
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(backend)?;
        Ok(row.map(|(owner,)| owner))
    }

    /// Delete expired leases. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64, LockError> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool.writer)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn backend(e: sqlx::Error) -> LockError {
    LockError::Backend(e.to_string())
}

impl DistributedLockManager for SqliteLockManager {
    async fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        resource_type: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = now_millis();
        let expires_at = now.saturating_add(ttl_millis(ttl));
        let result = sqlx::query(
            r#"INSERT INTO distributed_locks (lock_key, owner, resource_type, acquired_at, expires_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(lock_key) DO UPDATE SET
                 acquired_at = CASE WHEN distributed_locks.owner = excluded.owner
                                    THEN distributed_locks.acquired_at
                                    ELSE excluded.acquired_at END,
                 owner = excluded.owner,
                 resource_type = excluded.resource_type,
                 expires_at = excluded.expires_at
               WHERE distributed_locks.owner = excluded.owner
                  OR distributed_locks.expires_at <= ?"#,
        )
        .bind(key)
        .bind(owner)
        .bind(resource_type)
        .bind(Utc::now().to_rfc3339())
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;

        let acquired = result.rows_affected() > 0;
        if !acquired {
            tracing::debug!(key, owner, "lease held by another owner");
        }
        Ok(acquired)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE lock_key = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool.writer)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE distributed_locks SET expires_at = ? WHERE lock_key = ? AND owner = ? AND expires_at > ?",
        )
        .bind(now.saturating_add(ttl_millis(ttl)))
        .bind(key)
        .bind(owner)
        .bind(now)
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::lock::{BoxLockManager, workflow_lock_key};
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(30);

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("locks.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn second_owner_is_excluded() {
        let locks = SqliteLockManager::new(test_pool().await);
        let key = workflow_lock_key(1);
        assert!(locks.acquire_lock(&key, "engine-a", "workflow", TTL).await.unwrap());
        assert!(!locks.acquire_lock(&key, "engine-b", "workflow", TTL).await.unwrap());
        assert!(locks.acquire_lock(&key, "engine-a", "workflow", TTL).await.unwrap());
        assert_eq!(locks.holder(&key).await.unwrap().as_deref(), Some("engine-a"));
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let locks = SqliteLockManager::new(test_pool().await);
        assert!(locks
            .acquire_lock("k", "engine-a", "workflow", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(locks.holder("k").await.unwrap().is_none());
        assert!(locks.acquire_lock("k", "engine-b", "workflow", TTL).await.unwrap());
        assert!(!locks.renew_lock("k", "engine-a", TTL).await.unwrap());
        assert!(locks.renew_lock("k", "engine-b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn only_holder_releases() {
        let locks = SqliteLockManager::new(test_pool().await);
        locks.acquire_lock("k", "engine-a", "workflow", TTL).await.unwrap();
        assert!(!locks.release_lock("k", "engine-b").await.unwrap());
        assert!(locks.release_lock("k", "engine-a").await.unwrap());
        assert!(!locks.release_lock("k", "engine-a").await.unwrap());
        assert!(locks.acquire_lock("k", "engine-b", "workflow", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let locks = SqliteLockManager::new(test_pool().await);
        locks
            .acquire_lock("short", "engine-a", "workflow", Duration::from_millis(1))
            .await
            .unwrap();
        locks.acquire_lock("long", "engine-a", "workflow", TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.purge_expired().await.unwrap(), 1);
        assert_eq!(locks.holder("long").await.unwrap().as_deref(), Some("engine-a"));
    }

    #[tokio::test]
    async fn concurrent_acquirers_get_one_winner() {
        let pool = test_pool().await;
        let winners = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..8 {
            // Separate managers over the same database, like separate engines.
            let locks = SqliteLockManager::new(pool.clone());
            let winners = winners.clone();
            handles.push(tokio::spawn(async move {
                let owner = format!("engine-{i}");
                if locks.acquire_lock("workflow:7", &owner, "workflow", TTL).await.unwrap() {
                    winners.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(winners.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auto_renewal_keeps_short_lease_alive() {
        let manager = BoxLockManager::new(SqliteLockManager::new(test_pool().await));
        let ttl = Duration::from_millis(150);
        assert!(manager.acquire_lock("k", "engine-a", "workflow", ttl).await.unwrap());
        manager.enable_auto_renewal("k", "engine-a", "workflow", Duration::from_millis(40));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!manager.acquire_lock("k", "engine-b", "workflow", ttl).await.unwrap());

        manager.disable_auto_renewal("k", "engine-a");
        assert!(manager.release_lock("k", "engine-a").await.unwrap());
        assert!(manager.acquire_lock("k", "engine-b", "workflow", ttl).await.unwrap());
    }
}
