//! Key-value store contract.
//!
//! The durable store is external; this trait is the subset of its API the
//! engine relies on. Values are JSON; entries may carry a TTL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::errors::StoreError;

/// A stored value with its expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvEntry {
    /// The value.
    pub value: Value,
    /// When the entry stops being visible.
    pub expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    /// Creates an entry that expires `ttl` from now.
    #[must_use]
    pub fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(expiry_from_now),
        }
    }

    /// Returns true if the entry is expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Converts a TTL into an absolute expiry.
#[must_use]
pub fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One operation of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    /// Write `value` under `key`.
    Put {
        /// The key.
        key: String,
        /// The value.
        value: Value,
        /// Optional TTL.
        ttl: Option<Duration>,
    },
    /// Remove `key`.
    Delete {
        /// The key.
        key: String,
    },
    /// Precondition: `key` holds `expected` (`None` means absent).
    Assert {
        /// The key.
        key: String,
        /// Expected value.
        expected: Option<Value>,
    },
}

impl KvOp {
    /// Creates a put without TTL.
    #[must_use]
    pub fn put(key: impl Into<String>, value: Value) -> Self {
        Self::Put {
            key: key.into(),
            value,
            ttl: None,
        }
    }

    /// Creates a delete.
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    /// Creates an assert.
    #[must_use]
    pub fn assert(key: impl Into<String>, expected: Option<Value>) -> Self {
        Self::Assert {
            key: key.into(),
            expected,
        }
    }

    /// The key this op touches.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } | Self::Assert { key, .. } => key,
        }
    }
}

/// Async key-value store with atomic primitives.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the live entry under `key`.
    async fn get_entry(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;

    /// Returns the live value under `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get_entry(key).await?.map(|entry| entry.value))
    }

    /// Writes `value` unconditionally.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Writes only if no live entry exists. Returns true if written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Replaces the value only if it currently equals `expected`.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Deletes only if the value currently equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &Value) -> Result<bool, StoreError>;

    /// Deletes unconditionally. Returns true if a live entry existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Returns all live entries whose key starts with `prefix`, sorted by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Applies `ops` atomically. A failed `Assert` aborts the whole batch
    /// with [`StoreError::Conflict`].
    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), StoreError>;
}
