//! Checkpoint expiry
//!
//! Every checkpoint written while a TTL is configured gets an entry in the
//! expiry index (`x | expires_ms | thread | ns | version`). A sweep walks the
//! index up to `now` in key order, so it only ever touches due entries.
//!
//! Each candidate is re-read under its thread lock before removal. An entry
//! whose record moved on (refreshed on read, or already deleted) is stale: the
//! entry is dropped and the checkpoint kept.
//!
//! Reads also check `expires_at` themselves, so an expired checkpoint is never
//! returned even if no sweep has run yet.

use crate::{
    backend::ScanOrder,
    checkpoint::CheckpointConfig,
    error::{ErrorContext, Result},
    keys::{self, ExpiryEntry, KeyRange},
    store::{check_interrupt, decode_record, guarded, store_now, CheckpointStore},
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const SWEEP_BATCH: usize = 256;

impl CheckpointStore {
    /// Remove every checkpoint with `expires_at <= now`
    ///
    /// Returns the number of checkpoints removed. Without a configured TTL
    /// there is nothing to sweep.
    pub async fn apply_ttl(&self, now: DateTime<Utc>) -> Result<usize> {
        self.apply_ttl_with(now, &CheckpointConfig::default()).await
    }

    /// [`apply_ttl`](Self::apply_ttl) under a deadline or cancellation token
    ///
    /// Threads are swept one transaction at a time; an interrupted sweep keeps
    /// the removals it already committed.
    #[instrument(skip(self, config), fields(now = %now))]
    pub async fn apply_ttl_with(
        &self,
        now: DateTime<Utc>,
        config: &CheckpointConfig,
    ) -> Result<usize> {
        let ctx = ErrorContext::new("apply_ttl");
        let due = keys::expired_range(now);
        let mut start = due.start.clone();
        let mut removed = 0usize;

        loop {
            check_interrupt(config, &ctx)?;
            let window = KeyRange {
                start: start.clone(),
                end: due.end.clone(),
            };
            let batch = guarded(config, &ctx, async {
                let mut tx = self.inner.backend.begin().await?;
                let pairs = tx.scan(&window, ScanOrder::Ascending, SWEEP_BATCH).await?;
                tx.rollback().await?;
                Ok(pairs)
            })
            .await?;

            let Some((last, _)) = batch.last() else {
                break;
            };
            start = last.clone();
            start.push(0);

            let mut by_thread: BTreeMap<String, Vec<(Vec<u8>, ExpiryEntry)>> = BTreeMap::new();
            for (key, _) in &batch {
                let entry = keys::decode_expiry_key(key)?;
                by_thread
                    .entry(entry.thread_id.clone())
                    .or_default()
                    .push((key.clone(), entry));
            }
            for (thread_id, entries) in by_thread {
                removed += self
                    .sweep_thread(config, &ctx, &thread_id, entries, now)
                    .await?;
            }

            if batch.len() < SWEEP_BATCH {
                break;
            }
        }

        if removed > 0 {
            info!(removed, "Expired checkpoints swept");
        }
        Ok(removed)
    }

    async fn sweep_thread(
        &self,
        config: &CheckpointConfig,
        ctx: &ErrorContext,
        thread_id: &str,
        entries: Vec<(Vec<u8>, ExpiryEntry)>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let ctx = ctx.clone().with_thread(thread_id);
        let (guard, tx, removed) = guarded(config, &ctx, async {
            let guard = self.inner.locks.lock(thread_id).await;
            let mut tx = self.inner.backend.begin().await?;
            let mut removed = 0usize;

            for (expiry_key, entry) in &entries {
                let key = keys::checkpoint_key(thread_id, &entry.namespace, entry.version);
                let record = match tx.read(&key).await? {
                    Some(bytes) => decode_record(&bytes)?,
                    None => {
                        tx.delete(expiry_key).await?;
                        continue;
                    }
                };

                let current_ms = record
                    .expires_at
                    .map(|expires_at| expires_at.timestamp_millis().max(0) as u64);
                if current_ms != Some(entry.expires_ms) {
                    // Refreshed since this entry was written
                    tx.delete(expiry_key).await?;
                    continue;
                }
                if record.is_live(now) {
                    continue;
                }

                let writes = tx
                    .scan(
                        &keys::write_range(thread_id, &entry.namespace, entry.version),
                        ScanOrder::Ascending,
                        usize::MAX,
                    )
                    .await?;
                for (write_key, _) in writes {
                    tx.delete(&write_key).await?;
                }
                tx.delete(&keys::id_key(thread_id, &entry.namespace, &record.id))
                    .await?;
                tx.delete(&key).await?;
                tx.delete(expiry_key).await?;
                removed += 1;
            }
            Ok((guard, tx, removed))
        })
        .await?;

        tx.commit().await.map_err(|e| e.in_context(&ctx))?;
        drop(guard);
        if removed > 0 {
            debug!(thread_id, removed, "Swept thread");
        }
        Ok(removed)
    }

    /// Start the background sweeper if the configuration asks for one
    ///
    /// Needs both `ttl.default_ttl_minutes` and `ttl.sweep_interval_minutes`.
    pub fn spawn_sweeper(&self) -> Option<TtlSweeper> {
        self.inner.config.ttl.ttl()?;
        let every = self.inner.config.ttl.sweep_interval()?;
        Some(TtlSweeper::spawn(self.clone(), every))
    }
}

/// Background task running [`CheckpointStore::apply_ttl`] periodically
///
/// The first sweep runs immediately. Dropping the handle leaves the task
/// running; call [`stop`](Self::stop) to end it.
#[derive(Debug)]
pub struct TtlSweeper {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TtlSweeper {
    pub fn spawn(store: CheckpointStore, every: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let sweep_config = CheckpointConfig::default().with_cancellation(token.clone());
            info!(interval_secs = every.as_secs(), "TTL sweeper started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.apply_ttl_with(store_now(), &sweep_config).await {
                            Ok(removed) => debug!(removed, "TTL sweep finished"),
                            Err(e) if token.is_cancelled() => {
                                debug!(error = %e, "TTL sweep interrupted by shutdown");
                            }
                            Err(e) => warn!(error = %e, "TTL sweep failed"),
                        }
                    }
                }
            }
            info!("TTL sweeper stopped");
        });

        Self { shutdown, handle }
    }

    /// Signal shutdown and wait for the task to finish
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "TTL sweeper task ended abnormally");
        }
    }
}
