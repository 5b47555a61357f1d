//! Background renewal of an entity lock while a stage runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::manager::{EntityLockManager, LockToken};
use crate::cancellation::CancellationToken;
use crate::errors::LockError;

/// Reason recorded on the cancellation token when renewal fails.
pub const LOCK_LOST_REASON: &str = "entity lock lost";

/// Handle to a renewal task. The task stops when the handle is stopped or
/// dropped.
#[derive(Debug)]
pub struct LockKeepAlive {
    handle: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
}

impl LockKeepAlive {
    /// Returns true if renewal failed at some point.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stops renewing. Returns true if the lock was lost while running.
    pub fn stop(mut self) -> bool {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.is_lost()
    }
}

impl Drop for LockKeepAlive {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl EntityLockManager {
    /// Renews `token` every `interval`. When the lock is lost, or renewal
    /// keeps failing for a whole `ttl`, `cancel` is tripped and renewal
    /// stops.
    #[must_use]
    pub fn keep_alive(
        &self,
        token: LockToken,
        ttl: Duration,
        interval: Duration,
        cancel: Arc<CancellationToken>,
    ) -> LockKeepAlive {
        let lost = Arc::new(AtomicBool::new(false));
        let manager = self.clone();
        let flag = lost.clone();

        let handle = tokio::spawn(async move {
            let mut last_renewed = Instant::now();
            loop {
                tokio::time::sleep(interval).await;
                match manager.renew(&token, ttl).await {
                    Ok(()) => last_renewed = Instant::now(),
                    Err(LockError::Lost { .. }) => break,
                    Err(e) => {
                        warn!(entity_id = %token.entity_id, error = %e, "Lock renewal failed");
                        if last_renewed.elapsed() >= ttl {
                            break;
                        }
                        continue;
                    }
                }
                debug!(entity_id = %token.entity_id, "Lock kept alive");
            }
            flag.store(true, Ordering::SeqCst);
            cancel.cancel(LOCK_LOST_REASON);
        });

        LockKeepAlive {
            handle: Some(handle),
            lost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    #[tokio::test]
    async fn test_keeps_short_lock_alive() {
        let locks = EntityLockManager::new(Arc::new(MemoryKvStore::new()));
        let ttl = Duration::from_millis(60);
        let token = locks.acquire("e", ttl).await.unwrap().unwrap();
        let cancel = Arc::new(CancellationToken::new());

        let keepalive = locks.keep_alive(token.clone(), ttl, Duration::from_millis(15), cancel.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(locks.is_held_by(&token).await.unwrap());
        assert!(!keepalive.stop());
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_lost_lock_trips_cancellation() {
        let kv = Arc::new(MemoryKvStore::new());
        let locks = EntityLockManager::new(kv.clone());
        let ttl = Duration::from_secs(30);
        let token = locks.acquire("e", ttl).await.unwrap().unwrap();
        let cancel = Arc::new(CancellationToken::new());

        let keepalive = locks.keep_alive(token.clone(), ttl, Duration::from_millis(10), cancel.clone());
        locks.release(&token).await.unwrap();
        locks.acquire("e", ttl).await.unwrap().unwrap();

        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .unwrap();
        assert_eq!(cancel.reason().as_deref(), Some(LOCK_LOST_REASON));
        assert!(keepalive.is_lost());
        assert!(keepalive.stop());
    }
}
