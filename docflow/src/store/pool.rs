//! Connection pool with explicit readiness.
//!
//! A pool is created once at process start and injected into every
//! component that talks to an external system. It starts not-ready;
//! `warm_up` (or `mark_ready`) opens it. `acquire` waits for readiness, then
//! for a free slot, each with its own timeout.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::errors::PoolError;
use crate::retry::RetryLayer;

fn default_size() -> usize {
    8
}

fn default_acquire_timeout_seconds() -> f64 {
    5.0
}

fn default_ready_timeout_seconds() -> f64 {
    30.0
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum concurrent connections.
    #[serde(default = "default_size")]
    pub size: usize,
    /// How long `acquire` waits for a free connection.
    #[serde(default = "default_acquire_timeout_seconds")]
    pub acquire_timeout_seconds: f64,
    /// How long `ready` waits for warmup to finish.
    #[serde(default = "default_ready_timeout_seconds")]
    pub ready_timeout_seconds: f64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: default_size(),
            acquire_timeout_seconds: default_acquire_timeout_seconds(),
            ready_timeout_seconds: default_ready_timeout_seconds(),
        }
    }
}

impl PoolOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pool size.
    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Sets the acquire timeout.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Sets the readiness timeout.
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout_seconds = timeout.as_secs_f64();
        self
    }

    /// Acquire timeout as a Duration.
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.acquire_timeout_seconds.max(0.0))
    }

    /// Readiness timeout as a Duration.
    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ready_timeout_seconds.max(0.0))
    }
}

/// A borrowed connection slot. Returned to the pool on drop.
#[derive(Debug)]
pub struct PooledConnection {
    pool: String,
    id: u64,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Name of the owning pool.
    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Sequence number of this checkout.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A bounded pool of connection slots shared by all components of a process.
#[derive(Debug)]
pub struct ConnectionPool {
    name: String,
    options: PoolOptions,
    semaphore: Arc<Semaphore>,
    ready: watch::Sender<bool>,
    closed: AtomicBool,
    checkouts: AtomicU64,
}

impl ConnectionPool {
    /// Creates a pool that is not ready yet.
    #[must_use]
    pub fn new(name: impl Into<String>, options: PoolOptions) -> Arc<Self> {
        let (ready, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(options.size.max(1))),
            options,
            ready,
            closed: AtomicBool::new(false),
            checkouts: AtomicU64::new(0),
        })
    }

    /// Creates a pool that is ready immediately, for in-process backends
    /// that need no warmup.
    #[must_use]
    pub fn ready_now(name: impl Into<String>, options: PoolOptions) -> Arc<Self> {
        let pool = Self::new(name, options);
        pool.mark_ready();
        pool
    }

    /// The pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pool options.
    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Opens the pool.
    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
        info!(pool = %self.name, size = self.options.size, "Connection pool ready");
    }

    /// Returns true once warmup finished.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Free connection slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Runs `probe` through `retry` until it succeeds, then opens the pool.
    pub async fn warm_up<F, Fut, E>(&self, retry: &RetryLayer, probe: F) -> Result<(), PoolError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: StdError + 'static,
    {
        let started = Instant::now();
        match retry.call(probe).await {
            Ok(()) => {
                debug!(
                    pool = %self.name,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Warmup probe succeeded"
                );
                self.mark_ready();
                Ok(())
            }
            Err(e) => {
                warn!(pool = %self.name, error = %e, "Warmup failed");
                Err(PoolError::WarmupFailed {
                    pool: self.name.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Resolves once the pool is ready, or fails after the readiness
    /// timeout.
    pub async fn ready(&self) -> Result<(), PoolError> {
        self.ensure_open()?;
        if self.is_ready() {
            return Ok(());
        }
        let mut rx = self.ready.subscribe();
        let became_ready = matches!(
            tokio::time::timeout(self.options.ready_timeout(), rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        if became_ready {
            Ok(())
        } else {
            Err(self.not_ready())
        }
    }

    /// Guard for code that must not run before warmup finished.
    pub fn ensure_ready(&self) -> Result<(), PoolError> {
        self.ensure_open()?;
        if self.is_ready() {
            Ok(())
        } else {
            Err(self.not_ready())
        }
    }

    /// Waits for readiness, then borrows a connection slot.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        self.ready().await?;
        let started = Instant::now();
        let permit = tokio::time::timeout(
            self.options.acquire_timeout(),
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::Exhausted {
            pool: self.name.clone(),
            waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })?
        .map_err(|_| PoolError::Closed {
            pool: self.name.clone(),
        })?;

        Ok(PooledConnection {
            pool: self.name.clone(),
            id: self.checkouts.fetch_add(1, Ordering::Relaxed),
            _permit: permit,
        })
    }

    /// Closes the pool. Pending and future acquires fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
        info!(pool = %self.name, "Connection pool closed");
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PoolError::Closed {
                pool: self.name.clone(),
            })
        } else {
            Ok(())
        }
    }

    fn not_ready(&self) -> PoolError {
        PoolError::NotReady {
            pool: self.name.clone(),
        }
    }
}
