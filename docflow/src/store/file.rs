//! File-backed key-value store for single-node deployments.
//!
//! The whole table is kept in memory and written as one JSON snapshot after
//! every change (temp file plus rename). Writers are serialized; a change
//! becomes visible to readers only after its snapshot is on disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::kv::{KvEntry, KvOp, KvStore};
use super::memory::KvTable;
use crate::errors::StoreError;

/// A [`KvStore`] persisted to a JSON file.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    table: Mutex<KvTable>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileKvStore {
    /// Opens the store at `path`, loading the existing snapshot if any.
    /// Expired entries are dropped on load.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries: HashMap<String, KvEntry> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        let mut table = KvTable::from_entries(entries);
        let purged = table.purge_expired(Utc::now());
        info!(
            path = %path.display(),
            entries = table.entries().len(),
            purged,
            "Opened file store"
        );
        Ok(Self {
            path,
            table: Mutex::new(table),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read<T>(&self, f: impl FnOnce(&KvTable, DateTime<Utc>) -> T) -> T {
        f(&self.table.lock(), Utc::now())
    }

    /// Runs `f` on a copy of the table. When it reports a change, the copy
    /// is persisted and then swapped in.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut KvTable, DateTime<Utc>) -> Result<(T, bool), StoreError>,
    ) -> Result<T, StoreError> {
        let _writer = self.write_lock.lock().await;
        let mut next = self.table.lock().clone();
        let (value, changed) = f(&mut next, Utc::now())?;
        if changed {
            let bytes = serde_json::to_vec(next.entries())?;
            self.persist(bytes).await?;
            *self.table.lock() = next;
        }
        Ok(value)
    }

    async fn persist(&self, bytes: Vec<u8>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Persisted snapshot");
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get_entry(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        Ok(self.read(|table, now| table.get_entry(key, now)))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.mutate(|table, _| {
            table.set(key, KvEntry::new(value, ttl));
            Ok(((), true))
        })
        .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.mutate(|table, now| {
            let written = table.set_if_absent(key, KvEntry::new(value, ttl), now);
            Ok((written, written))
        })
        .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.mutate(|table, now| {
            let written = table.compare_and_set(key, expected, KvEntry::new(value, ttl), now);
            Ok((written, written))
        })
        .await
    }

    async fn compare_and_delete(&self, key: &str, expected: &Value) -> Result<bool, StoreError> {
        self.mutate(|table, now| {
            let deleted = table.compare_and_delete(key, expected, now);
            Ok((deleted, deleted))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.mutate(|table, now| {
            let existed = table.delete(key, now);
            Ok((existed, true))
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self.read(|table, now| table.scan_prefix(prefix, now)))
    }

    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        self.mutate(|table, now| {
            table.apply(ops, now)?;
            Ok(((), true))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let kv = FileKvStore::open(&path).await.unwrap();
            kv.set("wf:1", json!({"status": "RUNNING"}), None).await.unwrap();
            kv.apply(vec![
                KvOp::put("result:1:a", json!({"x": 1})),
                KvOp::assert("wf:1", Some(json!({"status": "RUNNING"}))),
            ])
            .await
            .unwrap();
        }

        let kv = FileKvStore::open(&path).await.unwrap();
        assert_eq!(kv.get("wf:1").await.unwrap(), Some(json!({"status": "RUNNING"})));
        assert_eq!(kv.scan_prefix("result:").await.unwrap().len(), 1);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_expired_entries_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let kv = FileKvStore::open(&path).await.unwrap();
            kv.set("lock:e1", json!("t"), Some(Duration::from_millis(20))).await.unwrap();
            kv.set("keep", json!(1), None).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        let kv = FileKvStore::open(&path).await.unwrap();
        assert_eq!(kv.get("lock:e1").await.unwrap(), None);
        assert_eq!(kv.get("keep").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_failed_apply_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKvStore::open(dir.path().join("s.json")).await.unwrap();

        let err = kv
            .apply(vec![KvOp::put("a", json!(1)), KvOp::assert("b", Some(json!(2)))])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            FileKvStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
