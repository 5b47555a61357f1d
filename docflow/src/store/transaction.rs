//! Time-budgeted atomic commits.
//!
//! A [`Transaction`] is a list of already-resolved writes and preconditions.
//! Lookups happen before it is built; the runner only commits.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::kv::{KvOp, KvStore};
use super::pool::ConnectionPool;
use crate::errors::StoreError;
use crate::retry::RetryLayer;

/// A batch of prepared writes committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    label: String,
    ops: Vec<KvOp>,
}

impl Transaction {
    /// Creates an empty transaction. The label shows up in logs and errors.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ops: Vec::new(),
        }
    }

    /// The transaction label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Adds one operation.
    pub fn push(&mut self, op: KvOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Adds several operations.
    pub fn extend(&mut self, ops: impl IntoIterator<Item = KvOp>) -> &mut Self {
        self.ops.extend(ops);
        self
    }

    /// The queued operations.
    #[must_use]
    pub fn ops(&self) -> &[KvOp] {
        &self.ops
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Commits transactions through the pool under a hard time budget.
#[derive(Clone)]
pub struct TransactionRunner {
    kv: Arc<dyn KvStore>,
    pool: Arc<ConnectionPool>,
    budget: Duration,
    retry: Option<RetryLayer>,
}

impl std::fmt::Debug for TransactionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRunner")
            .field("pool", &self.pool.name())
            .field("budget", &self.budget)
            .field("retry", &self.retry.as_ref().map(RetryLayer::name))
            .finish_non_exhaustive()
    }
}

impl TransactionRunner {
    /// Creates a runner without retries.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, pool: Arc<ConnectionPool>, budget: Duration) -> Self {
        Self {
            kv,
            pool,
            budget,
            retry: None,
        }
    }

    /// Wraps every commit in `layer`. Write conflicts are never retried:
    /// the caller has to re-read and rebuild the transaction.
    #[must_use]
    pub fn with_retry(mut self, layer: RetryLayer) -> Self {
        self.retry = Some(layer);
        self
    }

    /// The commit budget.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Commits `tx`.
    pub async fn commit(&self, tx: Transaction) -> Result<(), StoreError> {
        if tx.is_empty() {
            return Ok(());
        }
        match &self.retry {
            Some(layer) => {
                layer
                    .call_with(
                        |attempt| self.commit_once(&tx, attempt),
                        |error, class| class.is_retryable() && !error.is_conflict(),
                    )
                    .await
            }
            None => self.commit_once(&tx, 1).await,
        }
    }

    async fn commit_once(&self, tx: &Transaction, attempt: u32) -> Result<(), StoreError> {
        let _conn = self.pool.acquire().await?;
        self.pool.ensure_ready()?;

        match tokio::time::timeout(self.budget, self.kv.apply(tx.ops.clone())).await {
            Ok(Ok(())) => {
                debug!(label = %tx.label, ops = tx.len(), attempt, "Transaction committed");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let budget_ms = u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX);
                warn!(label = %tx.label, budget_ms, attempt, "Transaction exceeded budget");
                Err(StoreError::TransactionTimeout {
                    label: tx.label.clone(),
                    budget_ms,
                })
            }
        }
    }
}
