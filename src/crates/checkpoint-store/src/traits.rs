//! Engine-facing checkpoint interface
//!
//! A graph executor only needs to save a checkpoint after each step, read the
//! latest one back to resume, and walk history. [`CheckpointSaver`] is that
//! surface; [`CheckpointStore`] implements it for every [`KvBackend`], so an
//! executor can hold an `Arc<dyn CheckpointSaver>` and never see the backend.
//!
//! ```text
//!  executor step ── put() ──────────┐
//!  resume ───────── get_tuple() ────┤  CheckpointSaver
//!  history ──────── list() ─────────┤        │
//!  task output ──── put_writes() ───┘        ▼
//!                                     CheckpointStore ── KvBackend (memory, sqlite, ..)
//! ```
//!
//! [`KvBackend`]: crate::backend::KvBackend

use crate::{
    checkpoint::{Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple},
    error::Result,
    store::CheckpointStore,
};
use async_trait::async_trait;
use futures::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// Type alias for async stream of checkpoint tuples
pub type CheckpointStream =
    Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'static>>;

/// Checkpoint persistence as seen by a graph executor
///
/// Implementations must be thread-safe (`Send + Sync`) to support
/// concurrent graph executions.
///
/// ## Example
///
/// ```rust
/// use checkpoint_store::{
///     CheckpointConfig, Checkpoint, CheckpointMetadata, CheckpointSaver, CheckpointStore,
///     InMemoryBackend, StoreConfig,
/// };
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> checkpoint_store::Result<()> {
/// let saver: Arc<dyn CheckpointSaver> =
///     Arc::new(CheckpointStore::new(InMemoryBackend::new(), StoreConfig::default())?);
///
/// let config = CheckpointConfig::new("thread-1");
/// let stored = saver.put(&config, Checkpoint::empty(), CheckpointMetadata::new()).await?;
/// assert_eq!(stored.version, Some(1));
///
/// let resumed = saver.get(&config).await?;
/// assert!(resumed.is_some());
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch a checkpoint using the given configuration
    ///
    /// # Returns
    ///
    /// The requested checkpoint, or `None` if not found
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        if let Some(tuple) = self.get_tuple(config).await? {
            Ok(Some(tuple.checkpoint))
        } else {
            Ok(None)
        }
    }

    /// Retrieve a complete checkpoint tuple with metadata
    ///
    /// - `checkpoint_id` or `version` set: that checkpoint
    /// - only `thread_id` set: the latest checkpoint of the lineage
    ///
    /// `Ok(None)` (not an error) when nothing matches.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// Stream checkpoints newest first
    ///
    /// # Arguments
    ///
    /// * `config` - Thread to list; namespace unset means every namespace
    /// * `filter` - Metadata fields that must match exactly
    /// * `before` - Only versions strictly below this one
    /// * `limit` - Maximum number of checkpoints
    async fn list(
        &self,
        config: &CheckpointConfig,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<u64>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Save a checkpoint and return its full address (id and version)
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig>;

    /// Store intermediate writes linked to a checkpoint
    ///
    /// Writes from a task that finished while others in the same step are
    /// still running; they let a resumed run skip completed tasks.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: String,
    ) -> Result<()>;

    /// Delete all checkpoints and writes associated with a specific thread ID
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}

#[async_trait]
impl CheckpointSaver for CheckpointStore {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        CheckpointStore::get(self, config).await
    }

    async fn list(
        &self,
        config: &CheckpointConfig,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<u64>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        CheckpointStore::list(self, config, filter, before, limit).await
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig> {
        let tuple = CheckpointStore::put(self, config, checkpoint, metadata).await?;
        Ok(tuple.config)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: String,
    ) -> Result<()> {
        CheckpointStore::put_writes(self, config, writes, &task_id).await
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        CheckpointStore::delete_thread(self, &CheckpointConfig::new(thread_id)).await
    }
}
