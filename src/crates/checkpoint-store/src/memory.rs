//! In-memory backend for development and testing
//!
//! [`InMemoryBackend`] keeps every key in a `BTreeMap` behind a `tokio` RwLock.
//! Transactions buffer their writes and apply them in one critical section on
//! commit, so readers never observe a half-applied transaction and a dropped
//! transaction leaves no trace.
//!
//! Reads inside a transaction see committed state overlaid with the
//! transaction's own buffer. Isolation between concurrent writers is provided
//! one level up, by the store's per-thread locks.
//!
//! ```rust
//! use checkpoint_store::{CheckpointStore, InMemoryBackend, StoreConfig};
//!
//! let store = CheckpointStore::new(InMemoryBackend::new(), StoreConfig::default()).unwrap();
//! # let _ = store;
//! ```
//!
//! Data is lost when the last clone is dropped; use a database backend for
//! anything that must survive a restart.

use crate::{
    backend::{KvBackend, KvPair, KvTransaction, ScanOrder},
    error::Result,
    keys::KeyRange,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

type Storage = Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>;

/// Thread-safe in-memory key/value backend
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    storage: Storage,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed keys
    pub async fn key_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Committed value of a raw key
    pub async fn raw_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.storage.read().await.get(key).cloned()
    }

    /// Drop all data (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>> {
        Ok(Box::new(MemoryTransaction {
            storage: self.storage.clone(),
            pending: BTreeMap::new(),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Buffered writes: `Some(value)` is a put, `None` a delete
struct MemoryTransaction {
    storage: Storage,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

fn bounds(range: &KeyRange) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let end = match &range.end {
        Some(end) => Bound::Excluded(end.clone()),
        None => Bound::Unbounded,
    };
    (Bound::Included(range.start.clone()), end)
}

#[async_trait]
impl KvTransaction for MemoryTransaction {
    async fn read(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(buffered) = self.pending.get(key) {
            return Ok(buffered.clone());
        }
        Ok(self.storage.read().await.get(key).cloned())
    }

    async fn write(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.pending.insert(key.to_vec(), Some(value));
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.pending.insert(key.to_vec(), None);
        Ok(())
    }

    async fn scan(
        &mut self,
        range: &KeyRange,
        order: ScanOrder,
        limit: usize,
    ) -> Result<Vec<KvPair>> {
        if range.end.as_ref().is_some_and(|end| *end <= range.start) {
            return Ok(Vec::new());
        }

        // Merge committed state with this transaction's buffer
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        {
            let storage = self.storage.read().await;
            let committed = storage.range(bounds(range));
            let buffered_deletes = self.pending.values().filter(|v| v.is_none()).count();
            // Deleted keys may hide committed ones, so over-fetch by that much
            let wanted = limit.saturating_add(buffered_deletes);
            match order {
                ScanOrder::Ascending => {
                    for (k, v) in committed.take(wanted) {
                        merged.insert(k.clone(), v.clone());
                    }
                }
                ScanOrder::Descending => {
                    for (k, v) in committed.rev().take(wanted) {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        for (k, v) in self.pending.range(bounds(range)) {
            match v {
                Some(value) => {
                    merged.insert(k.clone(), value.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }

        let pairs: Vec<KvPair> = match order {
            ScanOrder::Ascending => merged.into_iter().take(limit).collect(),
            ScanOrder::Descending => merged.into_iter().rev().take(limit).collect(),
        };
        Ok(pairs)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut storage = self.storage.write().await;
        for (key, value) in self.pending {
            match value {
                Some(value) => {
                    storage.insert(key, value);
                }
                None => {
                    storage.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: &[u8], end: &[u8]) -> KeyRange {
        KeyRange::new(start.to_vec(), end.to_vec())
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        tx.write(b"a", b"1".to_vec()).await.unwrap();

        assert_eq!(tx.read(b"a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.raw_get(b"a").await, None);

        tx.commit().await.unwrap();
        assert_eq!(backend.raw_get(b"a").await, Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_dropped_transaction_leaves_no_trace() {
        let backend = InMemoryBackend::new();
        {
            let mut tx = backend.begin().await.unwrap();
            tx.write(b"a", b"1".to_vec()).await.unwrap();
        }
        let mut tx = backend.begin().await.unwrap();
        tx.write(b"b", b"2".to_vec()).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(backend.key_count().await, 0);
    }

    #[tokio::test]
    async fn test_scan_overlays_buffered_writes() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        for k in [b"k1", b"k2", b"k3", b"k4"] {
            tx.write(k, k.to_vec()).await.unwrap();
        }
        tx.commit().await.unwrap();

        let mut tx = backend.begin().await.unwrap();
        tx.delete(b"k4").await.unwrap();
        tx.write(b"k5", b"k5".to_vec()).await.unwrap();

        let keys = |pairs: Vec<KvPair>| pairs.into_iter().map(|(k, _)| k).collect::<Vec<_>>();

        let desc = tx
            .scan(&range(b"k", b"l"), ScanOrder::Descending, 2)
            .await
            .unwrap();
        assert_eq!(keys(desc), vec![b"k5".to_vec(), b"k3".to_vec()]);

        let asc = tx
            .scan(&range(b"k2", b"k9"), ScanOrder::Ascending, 10)
            .await
            .unwrap();
        assert_eq!(
            keys(asc),
            vec![b"k2".to_vec(), b"k3".to_vec(), b"k5".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_empty_range() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        tx.write(b"a", vec![]).await.unwrap();
        let pairs = tx
            .scan(&range(b"b", b"a"), ScanOrder::Ascending, 10)
            .await
            .unwrap();
        assert!(pairs.is_empty());
    }
}
