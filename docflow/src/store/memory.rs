//! In-process key-value store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::kv::{KvEntry, KvOp, KvStore};
use crate::errors::StoreError;

/// The table behind the in-process stores. Every method takes the current
/// time so expiry is evaluated once per call.
#[derive(Debug, Default, Clone)]
pub(crate) struct KvTable {
    entries: HashMap<String, KvEntry>,
}

impl KvTable {
    pub(crate) fn from_entries(entries: HashMap<String, KvEntry>) -> Self {
        Self { entries }
    }

    pub(crate) fn entries(&self) -> &HashMap<String, KvEntry> {
        &self.entries
    }

    fn live(&self, key: &str, now: DateTime<Utc>) -> Option<&KvEntry> {
        self.entries.get(key).filter(|entry| !entry.is_expired(now))
    }

    pub(crate) fn get_entry(&self, key: &str, now: DateTime<Utc>) -> Option<KvEntry> {
        self.live(key, now).cloned()
    }

    pub(crate) fn set(&mut self, key: &str, entry: KvEntry) {
        self.entries.insert(key.to_string(), entry);
    }

    pub(crate) fn set_if_absent(&mut self, key: &str, entry: KvEntry, now: DateTime<Utc>) -> bool {
        if self.live(key, now).is_some() {
            return false;
        }
        self.set(key, entry);
        true
    }

    pub(crate) fn compare_and_set(
        &mut self,
        key: &str,
        expected: &Value,
        entry: KvEntry,
        now: DateTime<Utc>,
    ) -> bool {
        match self.live(key, now) {
            Some(current) if &current.value == expected => {
                self.set(key, entry);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn compare_and_delete(&mut self, key: &str, expected: &Value, now: DateTime<Utc>) -> bool {
        match self.live(key, now) {
            Some(current) if &current.value == expected => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn delete(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .remove(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    pub(crate) fn scan_prefix(&self, prefix: &str, now: DateTime<Utc>) -> Vec<(String, Value)> {
        let mut found: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Checks every assert against the current state, then applies the
    /// writes in order.
    pub(crate) fn apply(&mut self, ops: Vec<KvOp>, now: DateTime<Utc>) -> Result<(), StoreError> {
        for op in &ops {
            if let KvOp::Assert { key, expected } = op {
                let current = self.live(key, now).map(|entry| &entry.value);
                if current != expected.as_ref() {
                    return Err(StoreError::conflict(key.clone()));
                }
            }
        }
        for op in ops {
            match op {
                KvOp::Put { key, value, ttl } => self.set(&key, KvEntry::new(value, ttl)),
                KvOp::Delete { key } => {
                    self.entries.remove(&key);
                }
                KvOp::Assert { .. } => {}
            }
        }
        Ok(())
    }

    pub(crate) fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }
}

/// A [`KvStore`] held in process memory.
///
/// Supports fault injection so retry paths can be exercised.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    table: Mutex<KvTable>,
    fail_next: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryKvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` operations fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Takes the store offline or back online.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().entries().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.table.lock().purge_expired(Utc::now())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("connection reset by peer".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_entry(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        self.check_available()?;
        Ok(self.table.lock().get_entry(key, Utc::now()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_available()?;
        self.table.lock().set(key, KvEntry::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .table
            .lock()
            .set_if_absent(key, KvEntry::new(value, ttl), Utc::now()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &Value,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .table
            .lock()
            .compare_and_set(key, expected, KvEntry::new(value, ttl), Utc::now()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &Value) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.table.lock().compare_and_delete(key, expected, Utc::now()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.table.lock().delete(key, Utc::now()))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.check_available()?;
        Ok(self.table.lock().scan_prefix(prefix, Utc::now()))
    }

    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        self.check_available()?;
        self.table.lock().apply(ops, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_get_delete() {
        let kv = MemoryKvStore::new();
        kv.set("a", json!({"x": 1}), None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(json!({"x": 1})));
        assert!(kv.delete("a").await.unwrap());
        assert!(!kv.delete("a").await.unwrap());
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[test]
    fn test_usable_outside_runtime() {
        let kv = MemoryKvStore::new();
        tokio_test::block_on(async {
            tokio_test::assert_ok!(kv.set("a", json!(1), None).await);
            assert_eq!(tokio_test::assert_ok!(kv.get("a").await), Some(json!(1)));
        });
        assert!(!kv.is_empty());
    }

    #[tokio::test]
    async fn test_set_if_absent_respects_ttl() {
        let kv = MemoryKvStore::new();
        assert!(kv.set_if_absent("lock", json!("t1"), Some(Duration::from_millis(30))).await.unwrap());
        assert!(!kv.set_if_absent("lock", json!("t2"), None).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(kv.get("lock").await.unwrap(), None);
        assert!(kv.set_if_absent("lock", json!("t2"), None).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), Some(json!("t2")));
    }

    #[tokio::test]
    async fn test_compare_and_set_and_delete() {
        let kv = MemoryKvStore::new();
        kv.set("k", json!(1), None).await.unwrap();
        assert!(!kv.compare_and_set("k", &json!(2), json!(3), None).await.unwrap());
        assert!(kv.compare_and_set("k", &json!(1), json!(3), None).await.unwrap());
        assert!(!kv.compare_and_delete("k", &json!(1)).await.unwrap());
        assert!(kv.compare_and_delete("k", &json!(3)).await.unwrap());
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_scan_prefix_sorted() {
        let kv = MemoryKvStore::new();
        kv.set("wf:2", json!(2), None).await.unwrap();
        kv.set("wf:1", json!(1), None).await.unwrap();
        kv.set("other", json!(0), None).await.unwrap();

        let found = kv.scan_prefix("wf:").await.unwrap();
        assert_eq!(found, vec![("wf:1".to_string(), json!(1)), ("wf:2".to_string(), json!(2))]);
    }

    #[tokio::test]
    async fn test_apply_is_all_or_nothing() {
        let kv = MemoryKvStore::new();
        kv.set("wf", json!({"rev": 1}), None).await.unwrap();

        let err = kv
            .apply(vec![
                KvOp::put("result", json!({"x": 1})),
                KvOp::assert("wf", Some(json!({"rev": 0}))),
                KvOp::put("wf", json!({"rev": 2})),
            ])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(kv.get("result").await.unwrap(), None);

        kv.apply(vec![
            KvOp::put("result", json!({"x": 1})),
            KvOp::assert("wf", Some(json!({"rev": 1}))),
            KvOp::assert("missing", None),
            KvOp::put("wf", json!({"rev": 2})),
        ])
        .await
        .unwrap();
        assert_eq!(kv.get("wf").await.unwrap(), Some(json!({"rev": 2})));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let kv = MemoryKvStore::new();
        kv.fail_next(2);
        assert!(kv.get("a").await.is_err());
        assert!(kv.get("a").await.is_err());
        assert!(kv.get("a").await.is_ok());

        kv.set_available(false);
        assert!(matches!(kv.get("a").await, Err(StoreError::Unavailable(_))));
        kv.set_available(true);
        assert!(kv.get("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_set_if_absent_single_winner() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.set_if_absent("entity", json!(i), None).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
