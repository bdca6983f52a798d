//! Checkpoint store over a transactional key/value backend
//!
//! [`CheckpointStore`] implements the checkpoint contract on top of any
//! [`KvBackend`]: version allocation, lineage validation, payload
//! serialization, TTL bookkeeping and lazy paginated listing.
//!
//! # Lifecycle of a `put`
//!
//! ```text
//!  put(config, checkpoint, metadata)
//!    │ validate thread/id/parent
//!    ├─ lock thread ───────────────┐   per-thread async mutex
//!    │  begin tx                   │
//!    │  id already stored? ── same content → return stored tuple
//!    │                      └─ differs     → Conflict
//!    │  head.last_version + 1      │   version allocation
//!    │  write record, id index, head, expiry index
//!    │  commit ────────────────────┘   not interruptible
//!    ▼
//!  CheckpointTuple { version, created_at, expires_at, .. }
//! ```
//!
//! Everything up to `commit` runs under the caller's deadline and
//! cancellation token. Abandoning the transaction is the rollback, so a
//! cancelled call leaves nothing behind.
//!
//! # Example
//!
//! ```rust
//! use checkpoint_store::{
//!     ChannelVersion, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointStore,
//!     InMemoryBackend, StoreConfig,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> checkpoint_store::Result<()> {
//! let store = CheckpointStore::new(InMemoryBackend::new(), StoreConfig::default())?;
//! let config = CheckpointConfig::new("demo_thread");
//!
//! let checkpoint = Checkpoint::empty().with_channel("status", json!("active"), ChannelVersion::Int(1));
//! let saved = store.put(&config, checkpoint, CheckpointMetadata::new()).await?;
//! assert_eq!(saved.checkpoint.version, 1);
//!
//! let latest = store.get(&config).await?.expect("just written");
//! assert_eq!(latest.checkpoint, saved.checkpoint);
//! # Ok(())
//! # }
//! ```

use crate::{
    backend::{KvBackend, KvTransaction, ScanOrder},
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
        PendingWrite,
    },
    config::StoreConfig,
    error::{CheckpointError, ErrorContext, Result},
    items::ItemStore,
    keys,
    locks::ThreadLocks,
    serializer::{EncryptedSerializer, JsonSerializer, SerializerProtocol},
    traits::CheckpointStream,
};
use async_stream::try_stream;
use chrono::{DateTime, SubsecRound, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Checkpoint persistence over a [`KvBackend`]
///
/// Cheap to clone; clones share the backend, configuration and locks.
#[derive(Clone)]
pub struct CheckpointStore {
    pub(crate) inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    pub(crate) backend: Arc<dyn KvBackend>,
    pub(crate) serializer: Arc<dyn SerializerProtocol>,
    pub(crate) config: StoreConfig,
    pub(crate) locks: ThreadLocks,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("backend", &self.inner.backend.name())
            .field("serializer", &self.inner.serializer)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Record stored under a checkpoint key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub(crate) id: String,
    pub(crate) version: u64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) channel_versions: ChannelVersions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) parent_version: Option<u64>,
    pub(crate) metadata: CheckpointMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) expires_at: Option<DateTime<Utc>>,
    /// Serialized (and possibly encrypted) channel values and pending writes
    #[serde(with = "base64_bytes")]
    pub(crate) payload: Vec<u8>,
}

impl StoredRecord {
    pub(crate) fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

/// Per-lineage bookkeeping stored under the head key
#[derive(Debug, Default, Serialize, Deserialize)]
struct LineageHead {
    last_version: u64,
    channels: BTreeSet<String>,
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    channel_values: &'a HashMap<String, serde_json::Value>,
    pending_writes: &'a [PendingWrite],
}

#[derive(Deserialize)]
struct Payload {
    channel_values: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pending_writes: Vec<PendingWrite>,
}

enum PutOutcome {
    /// Same id and content already stored; nothing to write
    Unchanged(CheckpointTuple),
    Staged(CheckpointTuple),
}

/// Binary fields inside JSON records
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(D::Error::custom)
    }
}

/// Store clock: millisecond precision so expiry keys and records agree exactly
pub(crate) fn store_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// `from + ttl`, or a `Config` error when that leaves the representable range
fn expiry_after(from: DateTime<Utc>, ttl: chrono::Duration) -> Result<DateTime<Utc>> {
    from.checked_add_signed(ttl).ok_or_else(|| {
        CheckpointError::Config(format!("ttl of {} minutes is out of range", ttl.num_minutes()))
    })
}

/// Stage removal of a record with its id index entry, task writes and expiry entry
async fn purge_record(
    tx: &mut dyn KvTransaction,
    thread_id: &str,
    namespace: &str,
    record: &StoredRecord,
) -> Result<()> {
    loop {
        let writes = tx
            .scan(
                &keys::write_range(thread_id, namespace, record.version),
                ScanOrder::Ascending,
                256,
            )
            .await?;
        if writes.is_empty() {
            break;
        }
        for (key, _) in &writes {
            tx.delete(key).await?;
        }
    }
    if let Some(expires_at) = record.expires_at {
        tx.delete(&keys::expiry_key(expires_at, thread_id, namespace, record.version))
            .await?;
    }
    tx.delete(&keys::id_key(thread_id, namespace, &record.id))
        .await?;
    tx.delete(&keys::checkpoint_key(thread_id, namespace, record.version))
        .await
}

pub(crate) fn context(operation: &'static str, config: &CheckpointConfig) -> ErrorContext {
    ErrorContext {
        operation,
        thread_id: config.thread_id.clone(),
        namespace: config.checkpoint_ns.clone(),
    }
}

fn require_thread<'a>(config: &'a CheckpointConfig, ctx: &ErrorContext) -> Result<&'a str> {
    match config.thread_id.as_deref() {
        Some(thread_id) if !thread_id.is_empty() => Ok(thread_id),
        _ => Err(CheckpointError::validation("thread_id is required").in_context(ctx)),
    }
}

/// Fail fast if the caller already gave up
pub(crate) fn check_interrupt(config: &CheckpointConfig, ctx: &ErrorContext) -> Result<()> {
    if config
        .cancellation
        .as_ref()
        .is_some_and(|token| token.is_cancelled())
    {
        return Err(CheckpointError::Cancelled {
            context: ctx.clone(),
        });
    }
    if config
        .deadline
        .is_some_and(|deadline| tokio::time::Instant::now() >= deadline)
    {
        return Err(CheckpointError::DeadlineExceeded {
            context: ctx.clone(),
        });
    }
    Ok(())
}

/// Run `fut` under the caller's cancellation token and deadline
///
/// Dropping `fut` drops any transaction it holds, which rolls it back.
pub(crate) async fn guarded<T>(
    config: &CheckpointConfig,
    ctx: &ErrorContext,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    let cancelled = async {
        match &config.cancellation {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let expired = async {
        match config.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => Err(CheckpointError::Cancelled { context: ctx.clone() }),
        _ = expired => Err(CheckpointError::DeadlineExceeded { context: ctx.clone() }),
        result = fut => result.map_err(|e| e.in_context(ctx)),
    }
}

pub(crate) fn decode_record(bytes: &[u8]) -> Result<StoredRecord> {
    serde_json::from_slice(bytes)
        .map_err(|e| CheckpointError::serialization(format!("corrupt checkpoint record: {}", e)))
}

pub(crate) fn encode_record(record: &StoredRecord) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

fn decode_version(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| CheckpointError::storage("corrupt id index entry"))?;
    Ok(u64::from_be_bytes(raw))
}

async fn read_version(tx: &mut dyn KvTransaction, key: &[u8]) -> Result<Option<u64>> {
    match tx.read(key).await? {
        Some(bytes) => Ok(Some(decode_version(&bytes)?)),
        None => Ok(None),
    }
}

/// Paging state of one namespace during `list`
struct PageCursor {
    namespace: String,
    /// Exclusive upper bound of the next page
    upper: u64,
    buffer: VecDeque<StoredRecord>,
    exhausted: bool,
}

impl PageCursor {
    fn new(namespace: String, upper: u64) -> Self {
        Self {
            namespace,
            upper,
            buffer: VecDeque::new(),
            exhausted: upper <= 1,
        }
    }
}

/// Cursor holding the newest buffered version; ties go to the first namespace
fn next_cursor(cursors: &[PageCursor]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (idx, cursor) in cursors.iter().enumerate() {
        if let Some(front) = cursor.buffer.front() {
            if best.map_or(true, |(_, version)| front.version > version) {
                best = Some((idx, front.version));
            }
        }
    }
    best.map(|(idx, _)| idx)
}

impl CheckpointStore {
    /// Create a store; payloads are encrypted when `config.encryption` is set
    pub fn new(backend: impl KvBackend, config: StoreConfig) -> Result<Self> {
        Self::from_backend(Arc::new(backend), config)
    }

    /// Create a store over a shared backend
    pub fn from_backend(backend: Arc<dyn KvBackend>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let serializer: Arc<dyn SerializerProtocol> = match &config.encryption {
            Some(encryption) => Arc::new(EncryptedSerializer::aes_gcm(encryption)?),
            None => Arc::new(JsonSerializer::new()),
        };
        Ok(Self::with_serializer(backend, config, serializer))
    }

    /// Create a store with a custom payload serializer
    pub fn with_serializer(
        backend: Arc<dyn KvBackend>,
        config: StoreConfig,
        serializer: Arc<dyn SerializerProtocol>,
    ) -> Self {
        info!(
            backend = backend.name(),
            ttl_minutes = ?config.ttl.default_ttl_minutes,
            refresh_on_read = config.ttl.refresh_on_read,
            "Checkpoint store ready"
        );
        Self {
            inner: Arc::new(StoreInner {
                backend,
                serializer,
                config,
                locks: ThreadLocks::new(),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.inner.backend
    }

    /// Cross-thread item store sharing this store's backend and serializer
    pub fn items(&self) -> ItemStore {
        ItemStore::new(self.inner.backend.clone(), self.inner.serializer.clone())
    }

    pub(crate) fn refreshes_on_read(&self) -> bool {
        self.inner.config.ttl.refresh_on_read && self.inner.config.ttl.ttl().is_some()
    }

    fn encode_payload(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>> {
        let value = serde_json::to_value(PayloadRef {
            channel_values: &checkpoint.channel_values,
            pending_writes: &checkpoint.pending_writes,
        })?;
        self.inner.serializer.dumps(&value)
    }

    fn decode_payload(&self, bytes: &[u8]) -> Result<Payload> {
        let value = self.inner.serializer.loads(bytes)?;
        serde_json::from_value(value)
            .map_err(|e| CheckpointError::serialization(format!("corrupt payload: {}", e)))
    }

    fn encode_write(&self, write: &PendingWrite) -> Result<Vec<u8>> {
        self.inner.serializer.dumps(&serde_json::to_value(write)?)
    }

    fn decode_write(&self, bytes: &[u8]) -> Result<PendingWrite> {
        let value = self.inner.serializer.loads(bytes)?;
        serde_json::from_value(value)
            .map_err(|e| CheckpointError::serialization(format!("corrupt task write: {}", e)))
    }

    async fn read_task_writes(
        &self,
        tx: &mut dyn KvTransaction,
        thread_id: &str,
        namespace: &str,
        version: u64,
    ) -> Result<Vec<PendingWrite>> {
        let pairs = tx
            .scan(
                &keys::write_range(thread_id, namespace, version),
                ScanOrder::Ascending,
                usize::MAX,
            )
            .await?;
        pairs
            .iter()
            .map(|(_, value)| self.decode_write(value))
            .collect()
    }

    fn build_tuple(
        &self,
        thread_id: &str,
        namespace: &str,
        record: StoredRecord,
        task_writes: Vec<PendingWrite>,
    ) -> Result<CheckpointTuple> {
        let payload = self.decode_payload(&record.payload)?;
        let config = CheckpointConfig::new(thread_id)
            .with_namespace(namespace)
            .with_checkpoint_id(record.id.clone())
            .with_version(record.version);
        let parent_config = match (&record.parent_id, record.parent_version) {
            (Some(parent_id), Some(parent_version)) => Some(
                CheckpointConfig::new(thread_id)
                    .with_namespace(namespace)
                    .with_checkpoint_id(parent_id.clone())
                    .with_version(parent_version),
            ),
            _ => None,
        };

        Ok(CheckpointTuple {
            config,
            checkpoint: Checkpoint {
                id: record.id,
                version: record.version,
                created_at: record.created_at,
                channel_values: payload.channel_values,
                channel_versions: record.channel_versions,
                pending_writes: payload.pending_writes,
                parent_id: record.parent_id,
            },
            metadata: record.metadata,
            parent_config,
            task_writes,
            expires_at: record.expires_at,
        })
    }

    async fn load_tuple(
        &self,
        thread_id: &str,
        namespace: &str,
        record: StoredRecord,
    ) -> Result<CheckpointTuple> {
        let mut tx = self.inner.backend.begin().await?;
        let writes = self
            .read_task_writes(tx.as_mut(), thread_id, namespace, record.version)
            .await?;
        tx.rollback().await?;
        self.build_tuple(thread_id, namespace, record, writes)
    }

    /// Persist a checkpoint as the next version of its lineage
    ///
    /// Returns the stored tuple with the allocated `version`, `created_at`
    /// and `expires_at`. Writing the same id again with identical content is a
    /// no-op that returns the stored tuple.
    ///
    /// # Errors
    ///
    /// - `Validation` - missing thread/id, unknown parent, or a channel version
    ///   for a channel the lineage never saw
    /// - `Conflict` - the id is stored with different content
    /// - `StorageUnavailable`, `Serialization`, `Cancelled`, `DeadlineExceeded`
    #[instrument(
        skip(self, config, checkpoint, metadata),
        fields(thread_id = ?config.thread_id, namespace = %config.namespace(), checkpoint_id = %checkpoint.id)
    )]
    pub async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointTuple> {
        let ctx = context("put", config);
        let thread_id = require_thread(config, &ctx)?;
        let namespace = config.namespace();

        if checkpoint.id.is_empty() {
            return Err(CheckpointError::validation("checkpoint id is required").in_context(&ctx));
        }
        if checkpoint.parent_id.as_deref() == Some(checkpoint.id.as_str()) {
            return Err(
                CheckpointError::validation("checkpoint cannot be its own parent")
                    .in_context(&ctx),
            );
        }

        let (guard, tx, outcome) = guarded(config, &ctx, async {
            let guard = self.inner.locks.lock(thread_id).await;
            let mut tx = self.inner.backend.begin().await?;
            let outcome = self
                .stage_put(tx.as_mut(), thread_id, namespace, checkpoint, metadata)
                .await?;
            Ok((guard, tx, outcome))
        })
        .await?;

        let tuple = match outcome {
            PutOutcome::Unchanged(tuple) => {
                tx.rollback().await.map_err(|e| e.in_context(&ctx))?;
                debug!(version = tuple.checkpoint.version, "Identical checkpoint already stored");
                tuple
            }
            PutOutcome::Staged(tuple) => {
                tx.commit().await.map_err(|e| e.in_context(&ctx))?;
                debug!(version = tuple.checkpoint.version, "Checkpoint stored");
                tuple
            }
        };
        drop(guard);
        Ok(tuple)
    }

    async fn stage_put(
        &self,
        tx: &mut dyn KvTransaction,
        thread_id: &str,
        namespace: &str,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<PutOutcome> {
        let id_key = keys::id_key(thread_id, namespace, &checkpoint.id);
        if let Some(existing_version) = read_version(tx, &id_key).await? {
            let bytes = tx
                .read(&keys::checkpoint_key(thread_id, namespace, existing_version))
                .await?
                .ok_or_else(|| {
                    CheckpointError::storage(format!(
                        "id index points at missing version {}",
                        existing_version
                    ))
                })?;
            let record = decode_record(&bytes)?;
            if record.is_live(store_now()) {
                let writes = self
                    .read_task_writes(tx, thread_id, namespace, existing_version)
                    .await?;
                let existing = self.build_tuple(thread_id, namespace, record, writes)?;
                if existing.checkpoint.same_content(&checkpoint) {
                    return Ok(PutOutcome::Unchanged(existing));
                }
                return Err(CheckpointError::conflict(format!(
                    "checkpoint {} is already stored as version {} with different content",
                    checkpoint.id, existing_version
                )));
            }
            // Expired but not swept yet: drop it and store the id afresh.
            purge_record(tx, thread_id, namespace, &record).await?;
            debug!(version = existing_version, "Replacing expired checkpoint with the same id");
        }

        let head_key = keys::head_key(thread_id, namespace);
        let mut head: LineageHead = match tx.read(&head_key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                CheckpointError::serialization(format!("corrupt lineage head: {}", e))
            })?,
            None => LineageHead::default(),
        };

        let parent_version = match &checkpoint.parent_id {
            Some(parent_id) => {
                let key = keys::id_key(thread_id, namespace, parent_id);
                Some(read_version(tx, &key).await?.ok_or_else(|| {
                    CheckpointError::validation(format!(
                        "parent checkpoint {} not found in lineage",
                        parent_id
                    ))
                })?)
            }
            None => None,
        };

        if let Some(channel) = checkpoint.channel_versions.keys().find(|channel| {
            !checkpoint.channel_values.contains_key(*channel) && !head.channels.contains(*channel)
        }) {
            return Err(CheckpointError::validation(format!(
                "channel {:?} has a version but no value in this lineage",
                channel
            )));
        }

        let version = head
            .last_version
            .checked_add(1)
            .ok_or_else(|| CheckpointError::conflict("lineage version space exhausted"))?;
        let created_at = store_now();
        let expires_at = match self.inner.config.ttl.ttl() {
            Some(ttl) => Some(expiry_after(created_at, ttl)?),
            None => None,
        };
        let payload = self.encode_payload(&checkpoint)?;

        let record = StoredRecord {
            id: checkpoint.id.clone(),
            version,
            created_at,
            channel_versions: checkpoint.channel_versions.clone(),
            parent_id: checkpoint.parent_id.clone(),
            parent_version,
            metadata: metadata.clone(),
            expires_at,
            payload,
        };
        tx.write(
            &keys::checkpoint_key(thread_id, namespace, version),
            encode_record(&record)?,
        )
        .await?;
        tx.write(&id_key, version.to_be_bytes().to_vec()).await?;
        if let Some(expires_at) = expires_at {
            tx.write(
                &keys::expiry_key(expires_at, thread_id, namespace, version),
                Vec::new(),
            )
            .await?;
        }
        head.last_version = version;
        head.channels
            .extend(checkpoint.channel_values.keys().cloned());
        tx.write(&head_key, serde_json::to_vec(&head)?).await?;

        let parent_config = match (&checkpoint.parent_id, parent_version) {
            (Some(parent_id), Some(parent_version)) => Some(
                CheckpointConfig::new(thread_id)
                    .with_namespace(namespace)
                    .with_checkpoint_id(parent_id.clone())
                    .with_version(parent_version),
            ),
            _ => None,
        };
        let config = CheckpointConfig::new(thread_id)
            .with_namespace(namespace)
            .with_checkpoint_id(checkpoint.id.clone())
            .with_version(version);

        Ok(PutOutcome::Staged(CheckpointTuple {
            config,
            checkpoint: Checkpoint {
                version,
                created_at,
                ..checkpoint
            },
            metadata,
            parent_config,
            task_writes: Vec::new(),
            expires_at,
        }))
    }

    /// Fetch a checkpoint
    ///
    /// - `checkpoint_id` set: that checkpoint
    /// - `version` set: that version of the lineage
    /// - neither: the latest live checkpoint of the lineage
    ///
    /// `Ok(None)` when nothing matches or the match has expired. With
    /// `refresh_on_read`, the returned tuple carries the pushed-back expiry.
    #[instrument(
        skip(self, config),
        fields(thread_id = ?config.thread_id, namespace = %config.namespace(), version = ?config.version)
    )]
    pub async fn get(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let ctx = context("get", config);
        let thread_id = require_thread(config, &ctx)?;
        let namespace = config.namespace();
        let now = store_now();

        let found = guarded(config, &ctx, async {
            let mut tx = self.inner.backend.begin().await?;
            let tuple = match self
                .locate(tx.as_mut(), thread_id, namespace, config, now)
                .await?
            {
                Some(record) => {
                    let writes = self
                        .read_task_writes(tx.as_mut(), thread_id, namespace, record.version)
                        .await?;
                    Some(self.build_tuple(thread_id, namespace, record, writes)?)
                }
                None => None,
            };
            tx.rollback().await?;
            Ok(tuple)
        })
        .await?;

        let Some(mut tuple) = found else {
            debug!("Checkpoint not found");
            return Ok(None);
        };

        if self.refreshes_on_read() {
            match self
                .refresh(config, &ctx, thread_id, namespace, tuple.checkpoint.version)
                .await?
            {
                Some(expires_at) => tuple.expires_at = Some(expires_at),
                None => return Ok(None),
            }
        }
        Ok(Some(tuple))
    }

    /// Fetch a checkpoint by its id; `checkpoint_id` must be set
    pub async fn get_by_id(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        if config.checkpoint_id.as_deref().map_or(true, str::is_empty) {
            return Err(CheckpointError::validation("checkpoint_id is required")
                .in_context(&context("get_by_id", config)));
        }
        self.get(config).await
    }

    async fn locate(
        &self,
        tx: &mut dyn KvTransaction,
        thread_id: &str,
        namespace: &str,
        config: &CheckpointConfig,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredRecord>> {
        let version = match (&config.checkpoint_id, config.version) {
            (Some(id), wanted) => {
                let key = keys::id_key(thread_id, namespace, id);
                match read_version(tx, &key).await? {
                    Some(version) if wanted.map_or(true, |w| w == version) => Some(version),
                    _ => return Ok(None),
                }
            }
            (None, Some(version)) => Some(version),
            (None, None) => None,
        };

        let Some(version) = version else {
            return self.latest_live(tx, thread_id, namespace, now).await;
        };
        let record = match tx
            .read(&keys::checkpoint_key(thread_id, namespace, version))
            .await?
        {
            Some(bytes) => decode_record(&bytes)?,
            None => return Ok(None),
        };
        Ok(record.is_live(now).then_some(record))
    }

    async fn latest_live(
        &self,
        tx: &mut dyn KvTransaction,
        thread_id: &str,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<StoredRecord>> {
        let page_size = self.inner.config.list_page_size;
        let mut upper = u64::MAX;
        loop {
            let page = tx
                .scan(
                    &keys::checkpoint_range(thread_id, namespace, 1, upper),
                    ScanOrder::Descending,
                    page_size,
                )
                .await?;
            let fetched = page.len();
            for (_, bytes) in page {
                let record = decode_record(&bytes)?;
                upper = record.version;
                if record.is_live(now) {
                    return Ok(Some(record));
                }
            }
            if fetched < page_size || upper <= 1 {
                return Ok(None);
            }
        }
    }

    /// Push the expiry of a live checkpoint to `now + ttl`
    ///
    /// `Ok(None)` when the checkpoint vanished or expired in the meantime.
    pub(crate) async fn refresh(
        &self,
        config: &CheckpointConfig,
        ctx: &ErrorContext,
        thread_id: &str,
        namespace: &str,
        version: u64,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(ttl) = self.inner.config.ttl.ttl() else {
            return Ok(None);
        };

        let (guard, tx, refreshed) = guarded(config, ctx, async {
            let guard = self.inner.locks.lock(thread_id).await;
            let mut tx = self.inner.backend.begin().await?;
            let key = keys::checkpoint_key(thread_id, namespace, version);
            let mut record = match tx.read(&key).await? {
                Some(bytes) => decode_record(&bytes)?,
                None => return Ok((guard, tx, None)),
            };
            let now = store_now();
            if !record.is_live(now) {
                return Ok((guard, tx, None));
            }

            let expires_at = expiry_after(now, ttl)?;
            if let Some(previous) = record.expires_at {
                tx.delete(&keys::expiry_key(previous, thread_id, namespace, version))
                    .await?;
            }
            tx.write(
                &keys::expiry_key(expires_at, thread_id, namespace, version),
                Vec::new(),
            )
            .await?;
            record.expires_at = Some(expires_at);
            tx.write(&key, encode_record(&record)?).await?;
            Ok((guard, tx, Some(expires_at)))
        })
        .await?;

        if refreshed.is_some() {
            tx.commit().await.map_err(|e| e.in_context(ctx))?;
            debug!(version, expires_at = ?refreshed, "Expiry refreshed on read");
        } else {
            tx.rollback().await.map_err(|e| e.in_context(ctx))?;
        }
        drop(guard);
        Ok(refreshed)
    }

    /// Stream checkpoints of a thread, newest version first
    ///
    /// With `checkpoint_ns` unset the namespaces of the thread are merged by
    /// version (ties by namespace). `filter` matches metadata fields, `before`
    /// keeps versions strictly below it, `limit` caps the item count.
    ///
    /// The stream reads `list_page_size` records per backend round-trip and
    /// checks the caller's cancellation token between items.
    #[instrument(
        skip(self, config, filter),
        fields(thread_id = ?config.thread_id, namespace = ?config.checkpoint_ns)
    )]
    pub async fn list(
        &self,
        config: &CheckpointConfig,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<u64>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let ctx = context("list", config);
        let thread_id = require_thread(config, &ctx)?.to_string();

        let namespaces = match &config.checkpoint_ns {
            Some(namespace) => vec![namespace.clone()],
            None => guarded(config, &ctx, self.thread_namespaces(&thread_id)).await?,
        };
        debug!(namespaces = namespaces.len(), "Listing checkpoints");

        Ok(Box::pin(self.clone().list_stream(
            config.clone(),
            ctx,
            thread_id,
            namespaces,
            filter,
            before,
            limit,
        )))
    }

    async fn thread_namespaces(&self, thread_id: &str) -> Result<Vec<String>> {
        let mut tx = self.inner.backend.begin().await?;
        let heads = tx
            .scan(
                &keys::thread_heads(thread_id),
                ScanOrder::Ascending,
                usize::MAX,
            )
            .await?;
        tx.rollback().await?;
        let mut namespaces = heads
            .iter()
            .map(|(key, _)| keys::decode_head_namespace(key))
            .collect::<Result<Vec<_>>>()?;
        namespaces.sort();
        Ok(namespaces)
    }

    async fn fill_page(&self, thread_id: &str, cursor: &mut PageCursor) -> Result<()> {
        let page_size = self.inner.config.list_page_size;
        let mut tx = self.inner.backend.begin().await?;
        let page = tx
            .scan(
                &keys::checkpoint_range(thread_id, &cursor.namespace, 1, cursor.upper),
                ScanOrder::Descending,
                page_size,
            )
            .await?;
        tx.rollback().await?;

        cursor.exhausted = page.len() < page_size;
        for (_, bytes) in page {
            let record = decode_record(&bytes)?;
            cursor.upper = record.version;
            cursor.buffer.push_back(record);
        }
        if cursor.upper <= 1 {
            cursor.exhausted = true;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn list_stream(
        self,
        config: CheckpointConfig,
        ctx: ErrorContext,
        thread_id: String,
        namespaces: Vec<String>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<u64>,
        limit: Option<usize>,
    ) -> impl Stream<Item = Result<CheckpointTuple>> + Send + 'static {
        try_stream! {
            let upper = before.unwrap_or(u64::MAX);
            let mut cursors: Vec<PageCursor> = namespaces
                .into_iter()
                .map(|namespace| PageCursor::new(namespace, upper))
                .collect();
            let mut remaining = limit.unwrap_or(usize::MAX);

            while remaining > 0 {
                check_interrupt(&config, &ctx)?;
                for cursor in cursors.iter_mut() {
                    if cursor.buffer.is_empty() && !cursor.exhausted {
                        guarded(&config, &ctx, self.fill_page(&thread_id, cursor)).await?;
                    }
                }

                let idx = match next_cursor(&cursors) {
                    Some(idx) => idx,
                    None => break,
                };
                let namespace = cursors[idx].namespace.clone();
                let record = match cursors[idx].buffer.pop_front() {
                    Some(record) => record,
                    None => break,
                };

                if !record.is_live(store_now()) {
                    continue;
                }
                if let Some(filter) = &filter {
                    if !record.metadata.matches(filter) {
                        continue;
                    }
                }

                let mut tuple =
                    guarded(&config, &ctx, self.load_tuple(&thread_id, &namespace, record)).await?;
                if self.refreshes_on_read() {
                    let refreshed = self
                        .refresh(&config, &ctx, &thread_id, &namespace, tuple.checkpoint.version)
                        .await?;
                    match refreshed {
                        Some(expires_at) => tuple.expires_at = Some(expires_at),
                        None => continue,
                    }
                }

                remaining -= 1;
                yield tuple;
            }
        }
    }

    /// Record intermediate writes of a task against a stored checkpoint
    ///
    /// The checkpoint is addressed by `checkpoint_id` or `version`. Writes
    /// keep their order and show up in [`CheckpointTuple::task_writes`].
    #[instrument(
        skip(self, config, writes),
        fields(thread_id = ?config.thread_id, namespace = %config.namespace(), writes = writes.len())
    )]
    pub async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: &str,
    ) -> Result<()> {
        let ctx = context("put_writes", config);
        let thread_id = require_thread(config, &ctx)?;
        let namespace = config.namespace();
        if config.checkpoint_id.is_none() && config.version.is_none() {
            return Err(
                CheckpointError::validation("checkpoint_id or version is required")
                    .in_context(&ctx),
            );
        }

        let (guard, tx) = guarded(config, &ctx, async {
            let guard = self.inner.locks.lock(thread_id).await;
            let mut tx = self.inner.backend.begin().await?;

            let version = match &config.checkpoint_id {
                Some(id) => read_version(tx.as_mut(), &keys::id_key(thread_id, namespace, id))
                    .await?
                    .ok_or_else(|| CheckpointError::not_found(format!("checkpoint {}", id)))?,
                None => config.version.unwrap_or_default(),
            };
            if tx
                .read(&keys::checkpoint_key(thread_id, namespace, version))
                .await?
                .is_none()
            {
                return Err(CheckpointError::not_found(format!(
                    "checkpoint version {}",
                    version
                )));
            }

            let last = tx
                .scan(
                    &keys::write_range(thread_id, namespace, version),
                    ScanOrder::Descending,
                    1,
                )
                .await?;
            let mut seq = match last.first() {
                Some((key, _)) => {
                    let tail: [u8; 4] = key[key.len() - 4..]
                        .try_into()
                        .map_err(|_| CheckpointError::storage("corrupt write key"))?;
                    u32::from_be_bytes(tail)
                        .checked_add(1)
                        .ok_or_else(|| CheckpointError::conflict("task write sequence exhausted"))?
                }
                None => 0,
            };

            let count = writes.len();
            for (index, (channel, value)) in writes.into_iter().enumerate() {
                let write = PendingWrite::new(task_id, channel, value);
                tx.write(
                    &keys::write_key(thread_id, namespace, version, seq),
                    self.encode_write(&write)?,
                )
                .await?;
                if index + 1 < count {
                    seq = seq
                        .checked_add(1)
                        .ok_or_else(|| CheckpointError::conflict("task write sequence exhausted"))?;
                }
            }
            Ok((guard, tx))
        })
        .await?;

        tx.commit().await.map_err(|e| e.in_context(&ctx))?;
        drop(guard);
        Ok(())
    }

    /// Remove every checkpoint, write and index entry of a thread
    ///
    /// Deleting a thread that does not exist succeeds.
    #[instrument(skip(self, config), fields(thread_id = ?config.thread_id))]
    pub async fn delete_thread(&self, config: &CheckpointConfig) -> Result<()> {
        let ctx = context("delete_thread", config);
        let thread_id = require_thread(config, &ctx)?;
        const BATCH: usize = 512;

        let (guard, tx, removed) = guarded(config, &ctx, async {
            let guard = self.inner.locks.lock(thread_id).await;
            let mut tx = self.inner.backend.begin().await?;
            let mut removed = 0usize;

            for range in keys::thread_ranges(thread_id) {
                loop {
                    let batch = tx.scan(&range, ScanOrder::Ascending, BATCH).await?;
                    if batch.is_empty() {
                        break;
                    }
                    for (key, value) in &batch {
                        if let Ok((namespace, version)) = keys::decode_checkpoint_key(key) {
                            removed += 1;
                            if let Some(expires_at) = decode_record(value)?.expires_at {
                                tx.delete(&keys::expiry_key(expires_at, thread_id, &namespace, version))
                                    .await?;
                            }
                        }
                        tx.delete(key).await?;
                    }
                }
            }
            Ok((guard, tx, removed))
        })
        .await?;

        tx.commit().await.map_err(|e| e.in_context(&ctx))?;
        drop(guard);
        info!(checkpoints = removed, "Thread deleted");
        Ok(())
    }
}
