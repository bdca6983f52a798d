//! Example of implementing a custom key/value backend
//!
//! A backend only needs [`KvBackend`] and [`KvTransaction`]. This one wraps
//! [`InMemoryBackend`] and counts committed transactions, which is the shape
//! a metrics or tracing layer around a real database would take.
//!
//! Run with `cargo run --example custom_backend -p checkpoint-store`.

use async_trait::async_trait;
use checkpoint_store::{
    ChannelVersion, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointStore,
    InMemoryBackend, KeyRange, KvBackend, KvPair, KvTransaction, Result, ScanOrder, StoreConfig,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Delegates to an inner backend and counts commits
#[derive(Clone, Default)]
struct CountingBackend {
    inner: InMemoryBackend,
    commits: Arc<AtomicUsize>,
}

struct CountingTransaction {
    inner: Box<dyn KvTransaction>,
    commits: Arc<AtomicUsize>,
}

#[async_trait]
impl KvBackend for CountingBackend {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>> {
        Ok(Box::new(CountingTransaction {
            inner: self.inner.begin().await?,
            commits: self.commits.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

#[async_trait]
impl KvTransaction for CountingTransaction {
    async fn read(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.read(key).await
    }

    async fn write(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.inner.write(key, value).await
    }

    async fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn scan(
        &mut self,
        range: &KeyRange,
        order: ScanOrder,
        limit: usize,
    ) -> Result<Vec<KvPair>> {
        self.inner.scan(range, order, limit).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await?;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let backend = CountingBackend::default();
    let store = CheckpointStore::new(backend.clone(), StoreConfig::default())?;
    let thread = CheckpointConfig::new("example-thread");

    for step in 1..=3 {
        store
            .put(
                &thread,
                Checkpoint::empty().with_channel("step", json!(step), ChannelVersion::Int(step)),
                CheckpointMetadata::new().with_step(step as i32),
            )
            .await?;
    }

    let latest = store.get(&thread).await?;
    println!(
        "latest version: {:?}",
        latest.map(|tuple| tuple.checkpoint.version)
    );
    println!("commits: {}", backend.commits.load(Ordering::Relaxed));
    Ok(())
}
