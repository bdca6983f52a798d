//! # checkpoint-sqlite - SQLite backend for checkpoint-store
//!
//! [`SqliteBackend`] implements [`KvBackend`] over a single `kv` table
//! (`key BLOB PRIMARY KEY, value BLOB`) using a `sqlx` connection pool.
//! SQLite compares blobs bytewise, so `ORDER BY key` is the byte order the
//! store's key layout relies on.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use checkpoint_sqlite::SqliteBackend;
//! use checkpoint_store::{CheckpointStore, PoolConfig, StoreConfig, TtlConfig};
//!
//! # async fn run() -> checkpoint_store::Result<()> {
//! let backend = SqliteBackend::connect("sqlite://checkpoints.db", &PoolConfig::default()).await?;
//! backend.setup().await?;
//!
//! let config = StoreConfig::default().with_ttl(TtlConfig::minutes(60));
//! let store = CheckpointStore::new(backend, config)?;
//! # let _ = store;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transactions
//!
//! SQLite allows one writer at a time. Each [`KvTransaction`] holds an
//! in-process gate for its whole lifetime so two transactions of the same
//! backend never race for the write lock. Other processes writing the same
//! file are covered by the busy timeout.

use async_trait::async_trait;
use checkpoint_store::{
    CheckpointError, CheckpointStore, KeyRange, KvBackend, KvPair, KvTransaction, PoolConfig,
    Result, ScanOrder, StoreConfig,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn storage(context: &'static str) -> impl FnOnce(sqlx::Error) -> CheckpointError {
    move |err| CheckpointError::storage_with_source(context, err)
}

/// Connection-pooled SQLite key/value backend
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    gate: Arc<Mutex<()>>,
}

impl SqliteBackend {
    /// Connect to a database URL such as `sqlite://state.db` or `sqlite::memory:`
    ///
    /// The file is created if missing. Call [`setup`](Self::setup) once before
    /// first use.
    pub async fn connect(url: &str, pool: &PoolConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(storage("invalid sqlite url"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        debug!(url = %url, "Connecting to database");
        let pool = SqlitePoolOptions::new()
            .min_connections(pool.min_connections)
            .max_connections(pool.max_connections)
            .connect_with(options)
            .await
            .map_err(storage("failed to connect to database"))?;

        info!(url = %url, "Database connection established");
        Ok(Self::from_pool(pool))
    }

    /// Open (or create) a database file
    pub async fn open(path: impl AsRef<Path>, pool: &PoolConfig) -> Result<Self> {
        let path = path.as_ref();
        let path = path.to_str().ok_or_else(|| {
            CheckpointError::Config(format!("database path is not UTF-8: {}", path.display()))
        })?;
        Self::connect(&format!("sqlite://{}", path), pool).await
    }

    /// Private in-memory database
    ///
    /// Every SQLite connection to `:memory:` is a separate database, so the
    /// pool is pinned to one connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(storage("invalid sqlite url"))?;
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(storage("failed to open in-memory database"))?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Create the schema; safe to call on every start
    ///
    /// Migrations are embedded in the binary and located in ./migrations
    pub async fn setup(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CheckpointError::storage_with_source("migration failed", e))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Connect, run migrations and build a store in one step
pub async fn connect_store(url: &str, config: StoreConfig) -> Result<CheckpointStore> {
    config.validate()?;
    let backend = SqliteBackend::connect(url, &config.pool).await?;
    backend.setup().await?;
    CheckpointStore::new(backend, config)
}

#[async_trait]
impl KvBackend for SqliteBackend {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>> {
        let gate = self.gate.clone().lock_owned().await;
        let tx = self
            .pool
            .begin()
            .await
            .map_err(storage("failed to begin transaction"))?;
        Ok(Box::new(SqliteTransaction { tx, _gate: gate }))
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    // Released after `tx` is dropped or finished
    _gate: OwnedMutexGuard<()>,
}

#[async_trait]
impl KvTransaction for SqliteTransaction {
    async fn read(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage("read failed"))?;
        Ok(row.map(|(value,)| value))
    }

    async fn write(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *self.tx)
        .await
        .map_err(storage("write failed"))?;
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .map_err(storage("delete failed"))?;
        Ok(())
    }

    async fn scan(
        &mut self,
        range: &KeyRange,
        order: ScanOrder,
        limit: usize,
    ) -> Result<Vec<KvPair>> {
        let direction = match order {
            ScanOrder::Ascending => "ASC",
            ScanOrder::Descending => "DESC",
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows: Vec<(Vec<u8>, Vec<u8>)> = match &range.end {
            Some(end) => {
                let sql = format!(
                    "SELECT key, value FROM kv WHERE key >= ? AND key < ? ORDER BY key {} LIMIT ?",
                    direction
                );
                sqlx::query_as(&sql)
                    .bind(range.start.as_slice())
                    .bind(end.as_slice())
                    .bind(limit)
                    .fetch_all(&mut *self.tx)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT key, value FROM kv WHERE key >= ? ORDER BY key {} LIMIT ?",
                    direction
                );
                sqlx::query_as(&sql)
                    .bind(range.start.as_slice())
                    .bind(limit)
                    .fetch_all(&mut *self.tx)
                    .await
            }
        }
        .map_err(storage("scan failed"))?;

        Ok(rows)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let SqliteTransaction { tx, _gate } = *self;
        tx.commit().await.map_err(storage("commit failed"))?;
        drop(_gate);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let SqliteTransaction { tx, _gate } = *self;
        tx.rollback().await.map_err(storage("rollback failed"))?;
        drop(_gate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> SqliteBackend {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.setup().await.unwrap();
        backend
    }

    async fn put(backend: &SqliteBackend, key: &[u8], value: &[u8]) {
        let mut tx = backend.begin().await.unwrap();
        tx.write(key, value.to_vec()).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let backend = backend().await;
        backend.setup().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let backend = backend().await;
        put(&backend, b"a", b"1").await;
        put(&backend, b"a", b"2").await;

        let mut tx = backend.begin().await.unwrap();
        assert_eq!(tx.read(b"a").await.unwrap(), Some(b"2".to_vec()));
        tx.delete(b"a").await.unwrap();
        assert_eq!(tx.read(b"a").await.unwrap(), None);
        tx.commit().await.unwrap();

        let mut tx = backend.begin().await.unwrap();
        assert_eq!(tx.read(b"a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_writes() {
        let backend = backend().await;

        let mut tx = backend.begin().await.unwrap();
        tx.write(b"k", b"v".to_vec()).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = backend.begin().await.unwrap();
        tx.write(b"k", b"v".to_vec()).await.unwrap();
        drop(tx);

        let mut tx = backend.begin().await.unwrap();
        assert_eq!(tx.read(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_is_bytewise_ordered() {
        let backend = backend().await;
        for key in [&b"b"[..], b"a", b"ab", b"\x00", b"\xff", b"b\x00"] {
            put(&backend, key, b"").await;
        }

        let mut tx = backend.begin().await.unwrap();
        let all = KeyRange {
            start: Vec::new(),
            end: None,
        };
        let keys: Vec<Vec<u8>> = tx
            .scan(&all, ScanOrder::Ascending, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(
            keys,
            vec![
                b"\x00".to_vec(),
                b"a".to_vec(),
                b"ab".to_vec(),
                b"b".to_vec(),
                b"b\x00".to_vec(),
                b"\xff".to_vec(),
            ]
        );

        let bounded = KeyRange::new(b"a".to_vec(), b"b".to_vec());
        let desc = tx.scan(&bounded, ScanOrder::Descending, 1).await.unwrap();
        assert_eq!(desc, vec![(b"ab".to_vec(), Vec::new())]);

        let prefix = KeyRange::prefix(b"b".to_vec());
        assert_eq!(tx.scan(&prefix, ScanOrder::Ascending, 10).await.unwrap().len(), 2);
    }
}
