#[path = "../../checkpoint-store/tests/common/mod.rs"]
mod common;

use checkpoint_sqlite::{connect_store, SqliteBackend};
use checkpoint_store::{
    AesGcmTransform, CheckpointConfig, CheckpointError, CheckpointMetadata, CheckpointStore,
    EncryptionConfig, KeyRange, KvBackend, PoolConfig, ScanOrder, StoreConfig,
};
use common::{contract_config, step};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

static TEST_DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Fresh database file in its own temp dir
async fn setup_test_backend() -> (TempDir, SqliteBackend) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let db_path = temp_dir.path().join(format!("test_{}.db", counter));

    let backend = SqliteBackend::open(&db_path, &PoolConfig::default())
        .await
        .expect("Failed to create test database");
    backend.setup().await.expect("Failed to run migrations");
    (temp_dir, backend)
}

#[tokio::test]
async fn test_sqlite_backend_passes_contract() {
    let (_dir, backend) = setup_test_backend().await;
    let store = CheckpointStore::new(backend, contract_config()).unwrap();
    common::run_all(&store).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_share_the_pool() {
    let (_dir, backend) = setup_test_backend().await;
    let store = CheckpointStore::new(backend, contract_config()).unwrap();
    common::concurrent_puts_get_consecutive_versions(&store)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_in_memory_database_passes_contract() {
    let backend = SqliteBackend::in_memory().await.unwrap();
    backend.setup().await.unwrap();
    let store = CheckpointStore::new(backend, contract_config()).unwrap();
    common::run_all(&store).await.unwrap();
}

#[tokio::test]
async fn test_checkpoints_survive_reconnect() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("state.db").display());
    let config = CheckpointConfig::new("t1");

    let store = connect_store(&url, StoreConfig::default()).await.unwrap();
    store
        .put(&config, step("a", 1), CheckpointMetadata::new())
        .await
        .unwrap();
    drop(store);

    let reopened = connect_store(&url, StoreConfig::default()).await.unwrap();
    let latest = reopened.get(&config).await.unwrap().expect("persisted");
    assert_eq!(latest.checkpoint.version, 1);
    assert_eq!(latest.checkpoint.channel_values["step"], json!("a"));
}

#[tokio::test]
async fn test_encrypted_rows_hide_plaintext() {
    let (_dir, backend) = setup_test_backend().await;
    let key = AesGcmTransform::generate_key();
    let store = CheckpointStore::new(
        backend.clone(),
        contract_config().with_encryption(EncryptionConfig::from_key(&key)),
    )
    .unwrap();
    let config = CheckpointConfig::new("t1");

    store
        .put(
            &config,
            step("encrypted_data_value", 1),
            CheckpointMetadata::new(),
        )
        .await
        .unwrap();

    let mut tx = backend.begin().await.unwrap();
    let everything = KeyRange {
        start: Vec::new(),
        end: None,
    };
    let rows = tx
        .scan(&everything, ScanOrder::Ascending, usize::MAX)
        .await
        .unwrap();
    drop(tx);
    assert!(!rows.is_empty());
    for (_, value) in rows {
        assert!(!value
            .windows(b"encrypted_data_value".len())
            .any(|w| w == b"encrypted_data_value"));
    }

    let other_key = CheckpointStore::new(
        backend,
        StoreConfig::default()
            .with_encryption(EncryptionConfig::from_key(&AesGcmTransform::generate_key())),
    )
    .unwrap();
    let err = other_key.get(&config).await.unwrap_err();
    assert!(matches!(err, CheckpointError::Serialization { .. }));
}
