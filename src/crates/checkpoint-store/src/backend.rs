//! Transactional key/value surface the store is written against
//!
//! A backend only has to offer ordered byte keys and transactions. The
//! [`CheckpointStore`](crate::store::CheckpointStore) owns the key layout,
//! version allocation and serialization, so adding a database means
//! implementing these two traits and nothing else.
//!
//! # Contract
//!
//! - Writes made in a transaction are visible to its own reads and scans.
//! - Nothing is visible to other transactions before `commit` returns.
//! - Dropping a transaction without committing discards it, exactly like
//!   `rollback`. Callers rely on this when an operation is cancelled.
//! - `scan` returns keys in byte order (or reverse byte order), at most
//!   `limit` entries.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut tx = backend.begin().await?;
//! let head = tx.read(&keys::head_key("t1", "")).await?;
//! tx.write(&keys::head_key("t1", ""), b"...".to_vec()).await?;
//! tx.commit().await?;
//! ```

use crate::error::Result;
use crate::keys::KeyRange;
use async_trait::async_trait;

/// Key/value pair returned by scans
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Direction of a range scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Ascending,
    Descending,
}

/// A durable, ordered key/value store with transactions
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// Start a transaction
    async fn begin(&self) -> Result<Box<dyn KvTransaction>>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// An open transaction on a [`KvBackend`]
#[async_trait]
pub trait KvTransaction: Send {
    async fn read(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn write(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;

    async fn delete(&mut self, key: &[u8]) -> Result<()>;

    async fn scan(&mut self, range: &KeyRange, order: ScanOrder, limit: usize)
        -> Result<Vec<KvPair>>;

    /// Make every write of this transaction visible atomically
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write of this transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}
