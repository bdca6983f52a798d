//! End-to-end tour of the SQLite-backed checkpoint store
//!
//! Run with:
//!
//! ```text
//! RUST_LOG=checkpoint_store=debug cargo run --example walkthrough -p checkpoint-sqlite
//! ```

use anyhow::{Context, Result};
use checkpoint_sqlite::{connect_store, SqliteBackend};
use checkpoint_store::{
    AesGcmTransform, ChannelVersion, Checkpoint, CheckpointConfig, CheckpointMetadata,
    CheckpointSource, CheckpointStore, EncryptionConfig, PoolConfig, StoreConfig, TtlConfig,
};
use futures::TryStreamExt;
use serde_json::json;
use std::collections::HashMap;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn message(text: &str, version: i64) -> Checkpoint {
    Checkpoint::empty().with_channel("messages", json!([text]), ChannelVersion::Int(version))
}

async fn basic_setup(url: &str) -> Result<()> {
    let store = connect_store(url, StoreConfig::default()).await?;
    let thread = CheckpointConfig::new("basic-thread");

    let stored = store
        .put(
            &thread,
            message("hello", 1),
            CheckpointMetadata::new().with_source(CheckpointSource::Input),
        )
        .await?;
    println!("stored version {}", stored.checkpoint.version);

    let loaded = store.get(&thread).await?.context("checkpoint missing")?;
    println!("retrieved: {}", json!(loaded.checkpoint.channel_values));

    let history: Vec<_> = store.list(&thread, None, None, None).await?.try_collect().await?;
    println!("found {} checkpoints", history.len());
    Ok(())
}

async fn encrypted_checkpoints(url: &str) -> Result<()> {
    let key = AesGcmTransform::generate_key();
    let config = StoreConfig::default().with_encryption(EncryptionConfig::from_key(&key));
    let store = connect_store(url, config).await?;
    let thread = CheckpointConfig::new("secure-thread");

    store
        .put(
            &thread,
            Checkpoint::empty().with_channel(
                "secret",
                json!("encrypted_data"),
                ChannelVersion::Int(1),
            ),
            CheckpointMetadata::new(),
        )
        .await?;
    println!("encrypted checkpoint stored");
    Ok(())
}

async fn ttl_checkpoints(url: &str) -> Result<()> {
    let config = StoreConfig::default()
        .with_ttl(TtlConfig::minutes(5).with_refresh_on_read(true));
    let store = connect_store(url, config).await?;
    let thread = CheckpointConfig::new("ttl-thread");

    let stored = store
        .put(&thread, message("short-lived", 1), CheckpointMetadata::new())
        .await?;
    let expires_at = stored.expires_at.context("ttl not applied")?;
    println!("checkpoint expires at {}", expires_at);

    let removed = store.apply_ttl(expires_at).await?;
    println!("sweep at expiry removed {} checkpoints", removed);
    Ok(())
}

async fn cross_thread_memory(store: &CheckpointStore) -> Result<()> {
    let items = store.items();
    let namespace = vec!["user_memories".to_string(), "user-123".to_string()];

    items
        .put(&namespace, "food_1", json!({"preference": "likes pizza", "kind": "food"}))
        .await?;
    items
        .put(&namespace, "food_2", json!({"preference": "avoids mushrooms", "kind": "food"}))
        .await?;
    items
        .put(&namespace, "music_1", json!({"preference": "jazz", "kind": "music"}))
        .await?;

    let filter = HashMap::from([("kind".to_string(), json!("food"))]);
    let results = items.search(&namespace, Some(&filter), 10, 0).await?;
    println!("found {} food-related memories", results.len());
    for item in results {
        println!("  - {}", item.value["preference"]);
    }
    Ok(())
}

async fn multi_thread_scenario(store: &CheckpointStore) -> Result<()> {
    for user in ["alice", "bob", "carol"] {
        let thread = CheckpointConfig::new(format!("user-{}", user));
        let mut parent = None;
        for step in 1..=3 {
            let mut checkpoint = message(&format!("{} step {}", user, step), step);
            if let Some(parent_id) = parent.take() {
                checkpoint = checkpoint.with_parent(parent_id);
            }
            let stored = store
                .put(
                    &thread,
                    checkpoint,
                    CheckpointMetadata::new()
                        .with_source(CheckpointSource::Loop)
                        .with_step(step as i32),
                )
                .await?;
            parent = Some(stored.checkpoint.id);
        }
        println!("checkpoints stored for {}", user);
    }

    for user in ["alice", "bob", "carol"] {
        let thread = CheckpointConfig::new(format!("user-{}", user));
        let history: Vec<_> = store.list(&thread, None, None, None).await?.try_collect().await?;
        println!("{}: {} checkpoints", user, history.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dir = TempDir::new()?;
    let url = format!("sqlite://{}", dir.path().join("walkthrough.db").display());

    println!("== basic setup");
    basic_setup(&url).await?;

    println!("== encrypted checkpoints");
    encrypted_checkpoints(&url).await?;

    println!("== ttl");
    ttl_checkpoints(&url).await?;

    let backend = SqliteBackend::connect(&url, &PoolConfig::default()).await?;
    backend.setup().await?;
    let store = CheckpointStore::new(backend.clone(), StoreConfig::default())?;

    println!("== cross-thread memory");
    cross_thread_memory(&store).await?;

    println!("== multi-thread scenario");
    multi_thread_scenario(&store).await?;

    backend.close().await;
    Ok(())
}
