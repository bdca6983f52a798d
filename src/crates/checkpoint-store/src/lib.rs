//! # checkpoint-store - Versioned Checkpoint Persistence
//!
//! **Durable, versioned snapshots of workflow execution state**, keyed by a
//! logical thread and an optional namespace, with optional expiry (TTL) and
//! optional at-rest encryption of payloads.
//!
//! ## Overview
//!
//! A workflow engine saves a checkpoint after every step. This crate stores
//! them so a run can:
//!
//! - **Resume** from the latest checkpoint after a crash or restart
//! - **Time-travel** to any earlier version of a thread
//! - **Branch** a new lineage from an old checkpoint (`parent_id`)
//! - **Expire** old state automatically with a TTL
//! - **Share memory** across threads through the [`ItemStore`]
//!
//! ## Core Concepts
//!
//! ### 1. Lineages and versions
//!
//! A *lineage* is `(thread_id, namespace)`. Inside it the store hands out
//! versions 1, 2, 3, ... with no gaps, even under concurrent writers. Each
//! checkpoint also has a writer-chosen `id`; writing the same id twice with
//! the same content is a no-op, with different content a conflict.
//!
//! ### 2. Backends
//!
//! The store is written against the small [`KvBackend`] trait: ordered byte
//! keys plus transactions. [`InMemoryBackend`] ships here; the
//! `checkpoint-sqlite` crate provides a relational backend.
//!
//! ### 3. Reads are lazy
//!
//! [`CheckpointStore::list`] returns a [`CheckpointStream`] that pages
//! through history; a thread with a million checkpoints costs one page of
//! memory.
//!
//! ### 4. Every call can be bounded
//!
//! [`CheckpointConfig`] carries an optional deadline and
//! [`CancellationToken`](tokio_util::sync::CancellationToken). An interrupted
//! call fails with `DeadlineExceeded` / `Cancelled` and leaves no partial
//! writes behind.
//!
//! ## Quick Start
//!
//! ```rust
//! use checkpoint_store::{
//!     ChannelVersion, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource,
//!     CheckpointStore, InMemoryBackend, StoreConfig, TtlConfig,
//! };
//! use futures::StreamExt;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> checkpoint_store::Result<()> {
//!     let config = StoreConfig::default().with_ttl(TtlConfig::minutes(60));
//!     let store = CheckpointStore::new(InMemoryBackend::new(), config)?;
//!     let thread = CheckpointConfig::new("user-123");
//!
//!     let v1 = store
//!         .put(
//!             &thread,
//!             Checkpoint::empty().with_channel("step", json!("setup"), ChannelVersion::Int(1)),
//!             CheckpointMetadata::new().with_source(CheckpointSource::Input),
//!         )
//!         .await?;
//!     let v2 = store
//!         .put(
//!             &thread,
//!             Checkpoint::empty()
//!                 .with_channel("step", json!("run"), ChannelVersion::Int(2))
//!                 .with_parent(v1.checkpoint.id.clone()),
//!             CheckpointMetadata::new().with_source(CheckpointSource::Loop),
//!         )
//!         .await?;
//!
//!     let versions: Vec<u64> = store
//!         .list(&thread, None, None, None)
//!         .await?
//!         .map(|t| t.map(|t| t.checkpoint.version))
//!         .collect::<Vec<_>>()
//!         .await
//!         .into_iter()
//!         .collect::<checkpoint_store::Result<_>>()?;
//!     assert_eq!(versions, vec![2, 1]);
//!
//!     let first = store.get(&thread.clone().with_version(1)).await?.expect("stored");
//!     assert_eq!(first.checkpoint, v1.checkpoint);
//!     assert!(v2.expires_at.is_some());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Workflow engine                                          │
//! │     └── Arc<dyn CheckpointSaver>                          │
//! └───────────────────────┬──────────────────────────────────┘
//!                         ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  CheckpointStore                                          │
//! │  • per-thread locks      • version allocation             │
//! │  • lineage validation    • TTL index + sweeper            │
//! │  • SerializerProtocol (JSON, optional AES-256-GCM)        │
//! │  ItemStore (cross-thread memory, same backend)            │
//! └───────────────────────┬──────────────────────────────────┘
//!                         │ KvBackend / KvTransaction
//!          ┌──────────────┴──────────────┐
//!          ▼                             ▼
//!   ┌──────────────┐            ┌─────────────────┐
//!   │ InMemory     │            │ SQLite (sqlx)   │
//!   │ (this crate) │            │ checkpoint-sqlite│
//!   └──────────────┘            └─────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`checkpoint`] - [`Checkpoint`], [`CheckpointConfig`], [`CheckpointMetadata`], [`CheckpointTuple`]
//! - [`store`] - [`CheckpointStore`], the engine
//! - [`ttl`] - expiry sweep and [`TtlSweeper`]
//! - [`items`] - [`ItemStore`]
//! - [`traits`] - [`CheckpointSaver`] and [`CheckpointStream`]
//! - [`backend`] / [`memory`] - backend traits and the in-memory backend
//! - [`keys`] - key layout shared by all backends
//! - [`serializer`] - payload serialization and encryption
//! - [`config`] / [`error`]

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod items;
pub mod keys;
mod locks;
pub mod memory;
pub mod serializer;
pub mod store;
pub mod traits;
pub mod ttl;

// Re-export main types
pub use backend::{KvBackend, KvPair, KvTransaction, ScanOrder};
pub use checkpoint::{
    ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointId,
    CheckpointMetadata, CheckpointSource, CheckpointTuple, PendingWrite,
};
pub use config::{EncryptionConfig, PoolConfig, StoreConfig, TtlConfig, MAX_TTL_MINUTES};
pub use error::{CheckpointError, ErrorContext, Result};
pub use items::{Item, ItemStore};
pub use keys::KeyRange;
pub use memory::InMemoryBackend;
pub use serializer::{
    AesGcmTransform, EncryptedSerializer, JsonSerializer, PayloadTransform, SerializerProtocol,
};
pub use store::CheckpointStore;
pub use traits::{CheckpointSaver, CheckpointStream};
pub use ttl::TtlSweeper;
