//! Core checkpoint data structures
//!
//! This module defines the types that flow through the store: **[`Checkpoint`]**,
//! **[`CheckpointConfig`]**, **[`CheckpointMetadata`]** and **[`CheckpointTuple`]**.
//!
//! # Identity
//!
//! A checkpoint lives in a *lineage*, the pair `(thread_id, namespace)`. The empty
//! namespace is the default one. Inside a lineage every checkpoint has
//!
//! - an `id` chosen by the writer (a UUID v4 unless set explicitly), and
//! - a `version` allocated by the store on `put`: 1, 2, 3, ... without gaps.
//!
//! `parent_id` links a checkpoint to the one it was derived from. The store only
//! follows it for lineage traversal; it never implies ownership.
//!
//! ```text
//!  thread "user-123", namespace ""
//!
//!   v1 (id a1) <── v2 (id b7) <── v3 (id c4)
//!                        ^
//!                        └──────── v4 (id d9)   fork from v2
//! ```
//!
//! # Addressing
//!
//! [`CheckpointConfig`] carries the address of a read or write and the caller's
//! deadline and cancellation token:
//!
//! ```rust
//! use checkpoint_store::CheckpointConfig;
//!
//! // Latest checkpoint in the default namespace
//! let latest = CheckpointConfig::new("user-123");
//!
//! // Exact version in a sub-namespace
//! let exact = CheckpointConfig::new("user-123")
//!     .with_namespace("planner")
//!     .with_version(3);
//! # let _ = (latest, exact);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Channel version type - can be int, float, or string
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChannelVersion {
    Int(i64),
    Float(f64),
    String(String),
}

impl ChannelVersion {
    /// Get the next version, `None` for string versions which are caller-managed
    pub fn next(&self) -> Option<Self> {
        match self {
            ChannelVersion::Int(v) => Some(ChannelVersion::Int(v + 1)),
            ChannelVersion::Float(v) => Some(ChannelVersion::Float(v + 1.0)),
            ChannelVersion::String(_) => None,
        }
    }
}

/// Mapping from channel name to version
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// A write produced by a task that has not been applied to its channel yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWrite {
    pub task_id: String,
    pub channel: String,
    pub value: serde_json::Value,
}

impl PendingWrite {
    pub fn new(
        task_id: impl Into<String>,
        channel: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            channel: channel.into(),
            value,
        }
    }
}

/// Metadata source type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Checkpoint created from an input to invoke/stream/batch
    Input,
    /// Checkpoint created from inside the execution loop
    Loop,
    /// Checkpoint created from a manual state update
    Update,
    /// Checkpoint created as a copy of another checkpoint
    Fork,
}

/// Metadata stored alongside a checkpoint
///
/// The store never interprets it; `list` filters compare against its JSON form,
/// so `{"source": "loop"}` and `{"user": "alice"}` (an `extra` key) both work.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// The step number of the checkpoint
    /// -1 for the first "input" checkpoint, 0 for the first "loop" checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i32>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_step(mut self, step: i32) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Whether every `(field, value)` pair of `filter` is present in this metadata
    pub fn matches(&self, filter: &HashMap<String, serde_json::Value>) -> bool {
        if filter.is_empty() {
            return true;
        }
        let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(self) else {
            return false;
        };
        filter
            .iter()
            .all(|(key, expected)| fields.get(key) == Some(expected))
    }
}

/// State snapshot at a given point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Unique within the lineage, chosen by the writer
    pub id: CheckpointId,

    /// Position in the lineage, allocated by the store (0 until stored)
    pub version: u64,

    /// Write time, set by the store
    pub created_at: DateTime<Utc>,

    /// Mapping from channel name to snapshot value
    pub channel_values: HashMap<String, serde_json::Value>,

    /// The versions of the channels at the time of the checkpoint
    pub channel_versions: ChannelVersions,

    /// Deferred writes not yet applied, in order
    #[serde(default)]
    pub pending_writes: Vec<PendingWrite>,

    /// Previous checkpoint in the same lineage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CheckpointId>,
}

impl Checkpoint {
    /// Create a new checkpoint with a fresh id
    pub fn new(
        channel_values: HashMap<String, serde_json::Value>,
        channel_versions: ChannelVersions,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: 0,
            created_at: Utc::now(),
            channel_values,
            channel_versions,
            pending_writes: Vec::new(),
            parent_id: None,
        }
    }

    /// Create an empty checkpoint
    pub fn empty() -> Self {
        Self::new(HashMap::new(), HashMap::new())
    }

    pub fn with_id(mut self, id: impl Into<CheckpointId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<CheckpointId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_pending_writes(mut self, writes: Vec<PendingWrite>) -> Self {
        self.pending_writes = writes;
        self
    }

    /// Set a channel value and its version together
    pub fn with_channel(
        mut self,
        channel: impl Into<String>,
        value: serde_json::Value,
        version: ChannelVersion,
    ) -> Self {
        let channel = channel.into();
        self.channel_values.insert(channel.clone(), value);
        self.channel_versions.insert(channel, version);
        self
    }

    /// Compare everything the writer controls, ignoring store-assigned fields
    pub fn same_content(&self, other: &Checkpoint) -> bool {
        self.id == other.id
            && self.channel_values == other.channel_values
            && self.channel_versions == other.channel_versions
            && self.pending_writes == other.pending_writes
            && self.parent_id == other.parent_id
    }
}

/// Address of a checkpoint operation plus per-call deadline and cancellation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointConfig {
    /// Thread ID for grouping related checkpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Checkpoint namespace, `None` means "any" for `list` and "" elsewhere
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,

    /// Specific checkpoint ID to retrieve
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    /// Specific lineage version to retrieve
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,

    /// Point in time after which the call fails with `DeadlineExceeded`
    #[serde(skip)]
    pub deadline: Option<Instant>,

    /// Token that aborts the call with `Cancelled`
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl CheckpointConfig {
    /// Address the latest checkpoint of a thread's default namespace
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(namespace.into());
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Namespace, defaulting to the empty one
    pub fn namespace(&self) -> &str {
        self.checkpoint_ns.as_deref().unwrap_or("")
    }
}

/// A stored checkpoint with everything the store knows about it
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// Full address of this checkpoint (thread, namespace, id, version)
    pub config: CheckpointConfig,

    /// The checkpoint itself
    pub checkpoint: Checkpoint,

    /// Metadata associated with the checkpoint
    pub metadata: CheckpointMetadata,

    /// Address of the parent checkpoint, if any
    pub parent_config: Option<CheckpointConfig>,

    /// Writes recorded against this checkpoint with `put_writes`, in order
    pub task_writes: Vec<PendingWrite>,

    /// When the checkpoint becomes eligible for the TTL sweep
    pub expires_at: Option<DateTime<Utc>>,
}

impl CheckpointTuple {
    pub fn thread_id(&self) -> &str {
        self.config.thread_id.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.config.namespace()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_creation() {
        let checkpoint = Checkpoint::empty();
        assert_eq!(checkpoint.version, 0);
        assert!(checkpoint.channel_values.is_empty());
        assert!(checkpoint.pending_writes.is_empty());
        assert!(checkpoint.parent_id.is_none());
        assert!(Uuid::parse_str(&checkpoint.id).is_ok());
    }

    #[test]
    fn test_channel_version_increment() {
        assert_eq!(ChannelVersion::Int(1).next(), Some(ChannelVersion::Int(2)));
        assert_eq!(
            ChannelVersion::Float(1.0).next(),
            Some(ChannelVersion::Float(2.0))
        );
        assert_eq!(ChannelVersion::String("a".into()).next(), None);
    }

    #[test]
    fn test_same_content_ignores_store_fields() {
        let a = Checkpoint::empty().with_channel("status", json!("active"), ChannelVersion::Int(1));
        let mut b = a.clone();
        b.version = 7;
        b.created_at = Utc::now() + chrono::Duration::minutes(5);
        assert!(a.same_content(&b));

        let c = a.clone().with_channel("status", json!("done"), ChannelVersion::Int(2));
        assert!(!a.same_content(&c));
    }

    #[test]
    fn test_metadata_filter_matches_flattened_fields() {
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Loop)
            .with_step(3)
            .with_extra("user", json!("alice"));

        let mut filter = HashMap::new();
        filter.insert("source".to_string(), json!("loop"));
        filter.insert("user".to_string(), json!("alice"));
        assert!(metadata.matches(&filter));

        filter.insert("step".to_string(), json!(4));
        assert!(!metadata.matches(&filter));
        assert!(metadata.matches(&HashMap::new()));
    }

    #[test]
    fn test_checkpoint_config() {
        let config = CheckpointConfig::new("thread-1")
            .with_namespace("inner")
            .with_version(2);

        assert_eq!(config.thread_id.as_deref(), Some("thread-1"));
        assert_eq!(config.namespace(), "inner");
        assert_eq!(config.version, Some(2));
        assert_eq!(CheckpointConfig::new("t").namespace(), "");
    }

    #[test]
    fn test_checkpoint_json_shape() {
        let checkpoint = Checkpoint::empty()
            .with_id("c1")
            .with_parent("c0")
            .with_pending_writes(vec![PendingWrite::new("task", "messages", json!("hi"))]);

        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["id"], json!("c1"));
        assert_eq!(value["parent_id"], json!("c0"));
        assert_eq!(value["pending_writes"][0]["channel"], json!("messages"));

        let restored: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(restored, checkpoint);
    }
}
