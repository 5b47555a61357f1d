//! Per-entity mutual exclusion on top of the key-value store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{LockError, StoreError};
use crate::store::KvStore;

/// Proof of holding the lock on one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken {
    /// Locked entity.
    pub entity_id: String,
    /// Random holder token.
    pub token: Uuid,
    /// When the lock was first taken.
    pub acquired_at: DateTime<Utc>,
}

/// Current state of an entity lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityLock {
    /// Locked entity.
    pub entity_id: String,
    /// Token of the live holder.
    pub holder_token: Uuid,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
    /// When it lapses unless renewed.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Acquires, renews, and releases entity locks.
///
/// The lock record is the serialized [`LockToken`]; the TTL lives on the
/// store entry, so a crashed holder's lock lapses on its own.
#[derive(Clone)]
pub struct EntityLockManager {
    kv: Arc<dyn KvStore>,
    namespace: String,
}

impl std::fmt::Debug for EntityLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityLockManager")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl EntityLockManager {
    /// Creates a manager in the `docflow` namespace.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            namespace: "docflow".to_string(),
        }
    }

    /// Sets the key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn key(&self, entity_id: &str) -> String {
        format!("{}:lock:{entity_id}", self.namespace)
    }

    /// Takes the lock if nobody holds it. Returns `None` when held.
    pub async fn acquire(&self, entity_id: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let token = LockToken {
            entity_id: entity_id.to_string(),
            token: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };
        let record = record(&token)?;
        if self.kv.set_if_absent(&self.key(entity_id), record, Some(ttl)).await? {
            info!(entity_id, token = %token.token, ttl_ms = millis(ttl), "Entity lock acquired");
            Ok(Some(token))
        } else {
            debug!(entity_id, "Entity lock held by another holder");
            Ok(None)
        }
    }

    /// Extends the lock. Fails with [`LockError::Lost`] if the caller no
    /// longer holds it.
    pub async fn renew(&self, token: &LockToken, ttl: Duration) -> Result<(), LockError> {
        let record = record(token)?;
        let renewed = self
            .kv
            .compare_and_set(&self.key(&token.entity_id), &record, record.clone(), Some(ttl))
            .await?;
        if renewed {
            debug!(entity_id = %token.entity_id, ttl_ms = millis(ttl), "Entity lock renewed");
            Ok(())
        } else {
            warn!(entity_id = %token.entity_id, token = %token.token, "Entity lock lost");
            Err(LockError::Lost {
                entity_id: token.entity_id.clone(),
            })
        }
    }

    /// Releases the lock if the caller still holds it. Idempotent; returns
    /// false when there was nothing to release.
    pub async fn release(&self, token: &LockToken) -> Result<bool, LockError> {
        let released = self
            .kv
            .compare_and_delete(&self.key(&token.entity_id), &record(token)?)
            .await?;
        if released {
            info!(entity_id = %token.entity_id, "Entity lock released");
        } else {
            debug!(entity_id = %token.entity_id, "Entity lock already released or expired");
        }
        Ok(released)
    }

    /// Renews `token` if still held, otherwise takes the lock afresh when
    /// nobody else holds it. `None` means another holder owns the entity.
    pub async fn reacquire(&self, token: &LockToken, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        match self.renew(token, ttl).await {
            Ok(()) => Ok(Some(token.clone())),
            Err(LockError::Lost { .. }) => self.acquire(&token.entity_id, ttl).await,
            Err(e) => Err(e),
        }
    }

    /// The live holder of `entity_id`.
    pub async fn holder(&self, entity_id: &str) -> Result<Option<EntityLock>, LockError> {
        let Some(entry) = self.kv.get_entry(&self.key(entity_id)).await? else {
            return Ok(None);
        };
        let token: LockToken = serde_json::from_value(entry.value).map_err(StoreError::from)?;
        Ok(Some(EntityLock {
            entity_id: token.entity_id,
            holder_token: token.token,
            acquired_at: token.acquired_at,
            expires_at: entry.expires_at,
        }))
    }

    /// Returns true if `token` is the live holder.
    pub async fn is_held_by(&self, token: &LockToken) -> Result<bool, LockError> {
        Ok(self
            .holder(&token.entity_id)
            .await?
            .is_some_and(|lock| lock.holder_token == token.token))
    }
}

fn record(token: &LockToken) -> Result<serde_json::Value, LockError> {
    serde_json::to_value(token).map_err(|e| LockError::Store(StoreError::from(e)))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    fn manager() -> EntityLockManager {
        EntityLockManager::new(Arc::new(MemoryKvStore::new()))
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_acquire_excludes_second_holder() {
        let locks = manager();
        let token = locks.acquire("invoice-1", TTL).await.unwrap().unwrap();
        assert!(locks.acquire("invoice-1", TTL).await.unwrap().is_none());
        assert!(locks.acquire("invoice-2", TTL).await.unwrap().is_some());

        let holder = locks.holder("invoice-1").await.unwrap().unwrap();
        assert_eq!(holder.holder_token, token.token);
        assert!(holder.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_owner_only() {
        let locks = manager();
        let token = locks.acquire("e", TTL).await.unwrap().unwrap();
        let impostor = LockToken {
            token: Uuid::new_v4(),
            ..token.clone()
        };

        assert!(!locks.release(&impostor).await.unwrap());
        assert!(locks.is_held_by(&token).await.unwrap());
        assert!(locks.release(&token).await.unwrap());
        assert!(!locks.release(&token).await.unwrap());
        assert!(locks.holder("e").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let locks = manager();
        let stale = locks.acquire("e", Duration::from_millis(20)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let fresh = locks.acquire("e", TTL).await.unwrap().unwrap();
        assert_ne!(fresh.token, stale.token);
        assert!(matches!(locks.renew(&stale, TTL).await, Err(LockError::Lost { .. })));
        assert!(!locks.release(&stale).await.unwrap());
        assert!(locks.is_held_by(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_extends_ttl() {
        let locks = manager();
        let token = locks.acquire("e", Duration::from_millis(40)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        locks.renew(&token, Duration::from_millis(80)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(locks.is_held_by(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_reacquire() {
        let locks = manager();
        let token = locks.acquire("e", Duration::from_millis(20)).await.unwrap().unwrap();
        assert_eq!(locks.reacquire(&token, TTL).await.unwrap(), Some(token.clone()));

        locks.release(&token).await.unwrap();
        let other = locks.acquire("e", TTL).await.unwrap().unwrap();
        assert!(locks.reacquire(&token, TTL).await.unwrap().is_none());

        locks.release(&other).await.unwrap();
        let fresh = locks.reacquire(&token, TTL).await.unwrap().unwrap();
        assert_ne!(fresh.token, token.token);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let locks = Arc::new(manager());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let locks = locks.clone();
                tokio::spawn(async move { locks.acquire("contended", TTL).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
