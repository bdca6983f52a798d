//! Backend-independent contract checks
//!
//! Every backend's integration suite runs these against a store built with
//! [`contract_config`]. Each check works on its own thread ids so they can
//! share one backend.

#![allow(dead_code)]

use checkpoint_store::{
    ChannelVersion, Checkpoint, CheckpointConfig, CheckpointError, CheckpointMetadata,
    CheckpointSource, CheckpointStore, Result, StoreConfig, TtlConfig,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static THREAD_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// TTL enabled and a small page size so paging is exercised
pub fn contract_config() -> StoreConfig {
    StoreConfig::default()
        .with_ttl(TtlConfig::minutes(60))
        .with_list_page_size(3)
}

pub fn unique_thread(prefix: &str) -> CheckpointConfig {
    let n = THREAD_COUNTER.fetch_add(1, Ordering::SeqCst);
    CheckpointConfig::new(format!("{}-{}", prefix, n))
}

pub fn step(value: &str, version: i64) -> Checkpoint {
    Checkpoint::empty().with_channel("step", json!(value), ChannelVersion::Int(version))
}

async fn versions(store: &CheckpointStore, config: &CheckpointConfig) -> Result<Vec<u64>> {
    let mut stream = store.list(config, None, None, None).await?;
    let mut versions = Vec::new();
    while let Some(tuple) = stream.next().await {
        versions.push(tuple?.checkpoint.version);
    }
    Ok(versions)
}

pub async fn put_then_get_returns_equal(store: &CheckpointStore) -> Result<()> {
    let config = unique_thread("round-trip");
    let checkpoint = Checkpoint::empty()
        .with_channel("messages", json!(["hi", {"role": "user"}]), ChannelVersion::Int(1))
        .with_channel("score", json!(0.25), ChannelVersion::Float(1.5))
        .with_channel("label", json!(null), ChannelVersion::String("v-a".into()))
        .with_pending_writes(vec![checkpoint_store::PendingWrite::new(
            "task-1",
            "messages",
            json!("pending"),
        )]);
    let metadata = CheckpointMetadata::new()
        .with_source(CheckpointSource::Input)
        .with_step(-1)
        .with_extra("user", json!("alice"));

    let stored = store.put(&config, checkpoint.clone(), metadata.clone()).await?;
    let read = store.get(&config).await?.expect("checkpoint just written");

    assert_eq!(read.checkpoint, stored.checkpoint);
    assert!(read.checkpoint.same_content(&checkpoint));
    assert_eq!(read.metadata, metadata);
    assert_eq!(read.expires_at, stored.expires_at);

    let by_id = store
        .get_by_id(&config.clone().with_checkpoint_id(checkpoint.id.clone()))
        .await?
        .expect("lookup by id");
    assert_eq!(by_id.checkpoint, stored.checkpoint);
    Ok(())
}

pub async fn concurrent_puts_get_consecutive_versions(store: &CheckpointStore) -> Result<()> {
    const WRITERS: u64 = 16;
    let config = unique_thread("concurrent");

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let store = store.clone();
            let config = config.clone();
            tokio::spawn(async move {
                store
                    .put(&config, step("w", i as i64), CheckpointMetadata::new())
                    .await
                    .map(|t| t.checkpoint.version)
            })
        })
        .collect();

    let mut allocated = Vec::new();
    for handle in handles {
        allocated.push(handle.await.expect("writer task panicked")?);
    }
    allocated.sort_unstable();
    assert_eq!(allocated, (1..=WRITERS).collect::<Vec<_>>());
    Ok(())
}

pub async fn list_is_newest_first(store: &CheckpointStore) -> Result<()> {
    let config = unique_thread("ordering");
    for i in 0..10 {
        store
            .put(&config, step("s", i), CheckpointMetadata::new().with_step(i as i32))
            .await?;
    }

    let listed = versions(store, &config).await?;
    assert_eq!(listed, (1..=10).rev().collect::<Vec<_>>());

    let mut limited = store.list(&config, None, Some(4), Some(2)).await?;
    assert_eq!(limited.next().await.transpose()?.map(|t| t.checkpoint.version), Some(3));
    assert_eq!(limited.next().await.transpose()?.map(|t| t.checkpoint.version), Some(2));
    assert!(limited.next().await.is_none());
    Ok(())
}

pub async fn apply_ttl_removes_exactly_due(store: &CheckpointStore) -> Result<()> {
    let config = unique_thread("ttl");
    let first = store.put(&config, step("a", 1), CheckpointMetadata::new()).await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = store.put(&config, step("b", 2), CheckpointMetadata::new()).await?;

    let first_due = first.expires_at.expect("ttl configured");
    let second_due = second.expires_at.expect("ttl configured");
    assert!(first_due < second_due);

    store
        .apply_ttl(first_due - chrono::Duration::milliseconds(1))
        .await?;
    assert!(store.get(&config.clone().with_version(1)).await?.is_some());

    store.apply_ttl(first_due).await?;
    assert!(store.get(&config.clone().with_version(1)).await?.is_none());
    assert!(store.get(&config.clone().with_version(2)).await?.is_some());
    assert_eq!(versions(store, &config).await?, vec![2]);
    Ok(())
}

pub async fn delete_thread_then_get_is_none(store: &CheckpointStore) -> Result<()> {
    let config = unique_thread("delete");
    let other = unique_thread("delete-bystander");
    let stored = store.put(&config, step("a", 1), CheckpointMetadata::new()).await?;
    store
        .put_writes(&stored.config, vec![("step".to_string(), json!("b"))], "task")
        .await?;
    store
        .put(&config.clone().with_namespace("child"), step("c", 1), CheckpointMetadata::new())
        .await?;
    store.put(&other, step("x", 1), CheckpointMetadata::new()).await?;

    store.delete_thread(&config).await?;
    store.delete_thread(&config).await?;

    assert!(store.get(&config).await?.is_none());
    assert!(store.get(&config.clone().with_namespace("child")).await?.is_none());
    assert!(versions(store, &config).await?.is_empty());
    assert!(store.get(&other).await?.is_some());

    // A fresh lineage under the same thread starts over
    let again = store.put(&config, step("a", 1), CheckpointMetadata::new()).await?;
    assert_eq!(again.checkpoint.version, 1);
    Ok(())
}

pub async fn lineage_scenario(store: &CheckpointStore) -> Result<()> {
    let config = unique_thread("scenario");
    let v1 = store
        .put(&config, step("setup", 1), CheckpointMetadata::new().with_step(0))
        .await?;
    let v2 = store
        .put(
            &config,
            step("run", 2).with_parent(v1.checkpoint.id.clone()),
            CheckpointMetadata::new().with_step(1),
        )
        .await?;

    assert_eq!(versions(store, &config).await?, vec![2, 1]);
    let first = store
        .get(&config.clone().with_version(1))
        .await?
        .expect("version 1");
    assert_eq!(first.checkpoint, v1.checkpoint);
    assert_eq!(
        v2.parent_config.as_ref().and_then(|p| p.checkpoint_id.as_deref()),
        Some(v1.checkpoint.id.as_str())
    );

    // Replaying the same write is harmless, changing it is not
    let replay = store
        .put(
            &config,
            step("run", 2)
                .with_id(v2.checkpoint.id.clone())
                .with_parent(v1.checkpoint.id.clone()),
            CheckpointMetadata::new().with_step(1),
        )
        .await?;
    assert_eq!(replay.checkpoint.version, 2);
    let conflict = store
        .put(
            &config,
            step("other", 3).with_id(v2.checkpoint.id.clone()),
            CheckpointMetadata::new(),
        )
        .await;
    assert!(matches!(conflict, Err(CheckpointError::Conflict { .. })));
    Ok(())
}

pub async fn cancelled_put_leaves_no_trace(store: &CheckpointStore) -> Result<()> {
    let config = unique_thread("cancelled");
    let token = CancellationToken::new();
    token.cancel();

    let result = store
        .put(
            &config.clone().with_cancellation(token),
            step("a", 1),
            CheckpointMetadata::new(),
        )
        .await;
    assert!(matches!(result, Err(CheckpointError::Cancelled { .. })));
    assert!(store.get(&config).await?.is_none());

    // The lineage is untouched: the next put still gets version 1
    let stored = store.put(&config, step("a", 1), CheckpointMetadata::new()).await?;
    assert_eq!(stored.checkpoint.version, 1);
    Ok(())
}

pub async fn cancelled_list_stops_between_items(store: &CheckpointStore) -> Result<()> {
    let config = unique_thread("cancelled-list");
    for (i, value) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        store
            .put(&config, step(value, i as i64 + 1), CheckpointMetadata::new())
            .await?;
    }

    let token = CancellationToken::new();
    let mut stream = store
        .list(&config.clone().with_cancellation(token.clone()), None, None, None)
        .await?;
    let first = stream.next().await.expect("first item")?;
    assert_eq!(first.checkpoint.version, 5);

    token.cancel();
    let next = stream.next().await.expect("interrupted item");
    assert!(matches!(next, Err(CheckpointError::Cancelled { .. })));
    assert!(stream.next().await.is_none());

    // Other listings of the thread are unaffected
    assert_eq!(versions(store, &config).await?, vec![5, 4, 3, 2, 1]);
    Ok(())
}

pub async fn task_writes_round_trip(store: &CheckpointStore) -> Result<()> {
    let config = unique_thread("writes");
    let stored = store.put(&config, step("a", 1), CheckpointMetadata::new()).await?;
    store
        .put_writes(
            &stored.config,
            vec![
                ("messages".to_string(), json!({"content": "partial"})),
                ("step".to_string(), json!("b")),
            ],
            "task-7",
        )
        .await?;

    let read = store.get(&config).await?.expect("stored");
    assert_eq!(read.task_writes.len(), 2);
    assert_eq!(read.task_writes[0].task_id, "task-7");
    assert_eq!(read.task_writes[1].value, json!("b"));

    let missing = store
        .put_writes(&config.clone().with_version(99), vec![], "task")
        .await;
    assert!(matches!(missing, Err(CheckpointError::NotFound { .. })));
    Ok(())
}

pub async fn items_round_trip(store: &CheckpointStore) -> Result<()> {
    let items = store.items();
    let ns = vec![
        "user_memories".to_string(),
        format!("user-{}", THREAD_COUNTER.fetch_add(1, Ordering::SeqCst)),
    ];

    items.put(&ns, "preference_1", json!({"theme": "dark"})).await?;
    items.put(&ns, "preference_2", json!({"theme": "light"})).await?;

    let item = items.get(&ns, "preference_1").await?.expect("stored");
    assert_eq!(item.value, json!({"theme": "dark"}));

    let found = items.search(&ns, None, 10, 0).await?;
    assert_eq!(found.len(), 2);
    assert!(items.delete(&ns, "preference_2").await?);
    assert_eq!(items.search(&ns, None, 10, 0).await?.len(), 1);
    Ok(())
}

/// Run every check in sequence
pub async fn run_all(store: &CheckpointStore) -> Result<()> {
    put_then_get_returns_equal(store).await?;
    concurrent_puts_get_consecutive_versions(store).await?;
    list_is_newest_first(store).await?;
    apply_ttl_removes_exactly_due(store).await?;
    delete_thread_then_get_is_none(store).await?;
    lineage_scenario(store).await?;
    cancelled_put_leaves_no_trace(store).await?;
    cancelled_list_stops_between_items(store).await?;
    task_writes_round_trip(store).await?;
    items_round_trip(store).await?;
    Ok(())
}
