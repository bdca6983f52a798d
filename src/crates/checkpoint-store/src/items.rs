//! Cross-thread item store
//!
//! Checkpoints belong to one thread. Items are the opposite: small JSON
//! documents addressed by a namespace path and a key, visible to every thread.
//! Typical use is long-term memory such as user preferences that a new
//! conversation should see.
//!
//! ```text
//!  ["user_memories", "user_123"] / "preference_1" -> {"theme": "dark"}
//!  ["user_memories", "user_456"] / "preference_1" -> {"theme": "light"}
//! ```
//!
//! Items have no versions or lineage and never expire. They share the
//! backend and payload serializer of the [`CheckpointStore`] they come from,
//! so encryption applies to item values too.
//!
//! ```rust
//! use checkpoint_store::{CheckpointStore, InMemoryBackend, StoreConfig};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> checkpoint_store::Result<()> {
//! let store = CheckpointStore::new(InMemoryBackend::new(), StoreConfig::default())?;
//! let items = store.items();
//! let ns = vec!["user_memories".to_string(), "user_123".to_string()];
//!
//! items.put(&ns, "preference_1", json!({"theme": "dark"})).await?;
//! let item = items.get(&ns, "preference_1").await?.expect("stored");
//! assert_eq!(item.value["theme"], "dark");
//! # Ok(())
//! # }
//! ```
//!
//! [`CheckpointStore`]: crate::store::CheckpointStore

use crate::{
    backend::{KvBackend, ScanOrder},
    error::{CheckpointError, ErrorContext, Result},
    keys::{self, KeyRange},
    serializer::SerializerProtocol,
    store::{base64_bytes, store_now},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument};

const SEARCH_PAGE: usize = 128;

/// A stored document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct StoredItem {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    value: Vec<u8>,
}

/// Namespaced key/value documents shared across threads
#[derive(Clone)]
pub struct ItemStore {
    backend: Arc<dyn KvBackend>,
    serializer: Arc<dyn SerializerProtocol>,
}

impl std::fmt::Debug for ItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

fn validate_address(namespace: &[String], key: &str, ctx: &ErrorContext) -> Result<()> {
    if namespace.is_empty() {
        return Err(CheckpointError::validation("item namespace is required").in_context(ctx));
    }
    if key.is_empty() {
        return Err(CheckpointError::validation("item key is required").in_context(ctx));
    }
    Ok(())
}

fn context(operation: &'static str, namespace: &[String]) -> ErrorContext {
    ErrorContext::new(operation).with_namespace(namespace.join("/"))
}

/// Every top-level field of `filter` is present in `value` with an equal value
fn matches_filter(value: &Value, filter: &HashMap<String, Value>) -> bool {
    match value {
        Value::Object(fields) => filter
            .iter()
            .all(|(field, expected)| fields.get(field) == Some(expected)),
        _ => filter.is_empty(),
    }
}

impl ItemStore {
    pub fn new(backend: Arc<dyn KvBackend>, serializer: Arc<dyn SerializerProtocol>) -> Self {
        Self {
            backend,
            serializer,
        }
    }

    fn decode(&self, raw_key: &[u8], bytes: &[u8]) -> Result<Item> {
        let (namespace, key) = keys::decode_item_key(raw_key)?;
        let stored: StoredItem = serde_json::from_slice(bytes)
            .map_err(|e| CheckpointError::serialization(format!("corrupt item record: {}", e)))?;
        Ok(Item {
            namespace,
            key,
            value: self.serializer.loads(&stored.value)?,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        })
    }

    /// Store `value`, replacing any previous value; `created_at` survives overwrites
    #[instrument(skip(self, value), fields(namespace = ?namespace))]
    pub async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<Item> {
        let ctx = context("item_put", namespace);
        validate_address(namespace, key, &ctx)?;
        let item = self
            .write_item(namespace, key, value)
            .await
            .map_err(|e| e.in_context(&ctx))?;
        debug!(key, "Item stored");
        Ok(item)
    }

    async fn write_item(&self, namespace: &[String], key: &str, value: Value) -> Result<Item> {
        let raw_key = keys::item_key(namespace, key);
        let mut tx = self.backend.begin().await?;
        let now = store_now();
        let created_at = match tx.read(&raw_key).await? {
            Some(bytes) => {
                let existing: StoredItem = serde_json::from_slice(&bytes).map_err(|e| {
                    CheckpointError::serialization(format!("corrupt item record: {}", e))
                })?;
                existing.created_at
            }
            None => now,
        };
        let stored = StoredItem {
            created_at,
            updated_at: now,
            value: self.serializer.dumps(&value)?,
        };
        tx.write(&raw_key, serde_json::to_vec(&stored)?).await?;
        tx.commit().await?;
        Ok(Item {
            namespace: namespace.to_vec(),
            key: key.to_string(),
            value,
            created_at,
            updated_at: now,
        })
    }

    #[instrument(skip(self), fields(namespace = ?namespace))]
    pub async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>> {
        let ctx = context("item_get", namespace);
        validate_address(namespace, key, &ctx)?;
        self.read_item(namespace, key)
            .await
            .map_err(|e| e.in_context(&ctx))
    }

    async fn read_item(&self, namespace: &[String], key: &str) -> Result<Option<Item>> {
        let raw_key = keys::item_key(namespace, key);
        let mut tx = self.backend.begin().await?;
        let found = tx.read(&raw_key).await?;
        tx.rollback().await?;
        found.map(|bytes| self.decode(&raw_key, &bytes)).transpose()
    }

    /// Remove an item; `false` when there was nothing to remove
    #[instrument(skip(self), fields(namespace = ?namespace))]
    pub async fn delete(&self, namespace: &[String], key: &str) -> Result<bool> {
        let ctx = context("item_delete", namespace);
        validate_address(namespace, key, &ctx)?;
        self.remove_item(namespace, key)
            .await
            .map_err(|e| e.in_context(&ctx))
    }

    async fn remove_item(&self, namespace: &[String], key: &str) -> Result<bool> {
        let raw_key = keys::item_key(namespace, key);
        let mut tx = self.backend.begin().await?;
        if tx.read(&raw_key).await?.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.delete(&raw_key).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Items whose namespace starts with `prefix`, in key order
    ///
    /// `filter` compares top-level fields of object values. `offset` counts
    /// matching items, not scanned ones.
    #[instrument(skip(self, filter), fields(prefix = ?prefix))]
    pub async fn search(
        &self,
        prefix: &[String],
        filter: Option<&HashMap<String, Value>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Item>> {
        let ctx = context("item_search", prefix);
        let mut results = Vec::new();
        let mut skipped = 0usize;
        self.scan_items(prefix, |item| {
            if filter.is_some_and(|f| !matches_filter(&item.value, f)) {
                return true;
            }
            if skipped < offset {
                skipped += 1;
                return true;
            }
            if results.len() < limit {
                results.push(item);
            }
            results.len() < limit
        })
        .await
        .map_err(|e| e.in_context(&ctx))?;
        Ok(results)
    }

    /// Distinct namespaces under `prefix` (all when `None`), sorted
    #[instrument(skip(self))]
    pub async fn list_namespaces(&self, prefix: Option<&[String]>) -> Result<Vec<Vec<String>>> {
        let prefix = prefix.unwrap_or(&[]);
        let ctx = context("item_list_namespaces", prefix);
        let mut namespaces = BTreeSet::new();
        self.scan_items(prefix, |item| {
            namespaces.insert(item.namespace);
            true
        })
        .await
        .map_err(|e| e.in_context(&ctx))?;
        Ok(namespaces.into_iter().collect())
    }

    /// Feed items under `prefix` to `visit` page by page until it returns `false`
    async fn scan_items(
        &self,
        prefix: &[String],
        mut visit: impl FnMut(Item) -> bool,
    ) -> Result<()> {
        let range = keys::item_range(prefix);
        let mut start = range.start.clone();
        loop {
            let window = KeyRange {
                start: start.clone(),
                end: range.end.clone(),
            };
            let mut tx = self.backend.begin().await?;
            let page = tx.scan(&window, ScanOrder::Ascending, SEARCH_PAGE).await?;
            tx.rollback().await?;

            let fetched = page.len();
            for (raw_key, bytes) in page {
                start = raw_key.clone();
                start.push(0);
                if !visit(self.decode(&raw_key, &bytes)?) {
                    return Ok(());
                }
            }
            if fetched < SEARCH_PAGE {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use crate::serializer::JsonSerializer;
    use serde_json::json;

    fn items() -> ItemStore {
        ItemStore::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(JsonSerializer::new()),
        )
    }

    fn ns(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_put_get_overwrite_keeps_created_at() {
        let items = items();
        let user = ns(&["user_memories", "user_123"]);

        let first = items
            .put(&user, "preference_1", json!({"theme": "dark"}))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = items
            .put(&user, "preference_1", json!({"theme": "light"}))
            .await
            .unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);

        let stored = items.get(&user, "preference_1").await.unwrap().unwrap();
        assert_eq!(stored, second);
        assert!(items.get(&user, "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let items = items();
        let user = ns(&["user_memories", "user_123"]);
        items.put(&user, "k", json!(1)).await.unwrap();

        assert!(items.delete(&user, "k").await.unwrap());
        assert!(!items.delete(&user, "k").await.unwrap());
        assert!(items.get(&user, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_prefix_filter_and_paging() {
        let items = items();
        for i in 0..5 {
            let lang = if i % 2 == 0 { "rust" } else { "go" };
            items
                .put(
                    &ns(&["user_memories", "user_123"]),
                    &format!("fact_{}", i),
                    json!({"lang": lang, "n": i}),
                )
                .await
                .unwrap();
        }
        items
            .put(&ns(&["user_memories", "user_456"]), "fact_0", json!({"lang": "rust"}))
            .await
            .unwrap();
        items
            .put(&ns(&["system"]), "fact_0", json!({"lang": "rust"}))
            .await
            .unwrap();

        let all = items
            .search(&ns(&["user_memories"]), None, 100, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 6);

        let mut filter = HashMap::new();
        filter.insert("lang".to_string(), json!("rust"));
        let rust = items
            .search(&ns(&["user_memories", "user_123"]), Some(&filter), 10, 1)
            .await
            .unwrap();
        let keys: Vec<_> = rust.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["fact_2", "fact_4"]);

        let limited = items.search(&ns(&[]), None, 2, 0).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_list_namespaces() {
        let items = items();
        items.put(&ns(&["a", "x"]), "k", json!(1)).await.unwrap();
        items.put(&ns(&["a", "x"]), "k2", json!(1)).await.unwrap();
        items.put(&ns(&["a", "y"]), "k", json!(1)).await.unwrap();
        items.put(&ns(&["b"]), "k", json!(1)).await.unwrap();

        assert_eq!(
            items.list_namespaces(None).await.unwrap(),
            vec![ns(&["a", "x"]), ns(&["a", "y"]), ns(&["b"])]
        );
        assert_eq!(
            items.list_namespaces(Some(&ns(&["a"]))).await.unwrap(),
            vec![ns(&["a", "x"]), ns(&["a", "y"])]
        );
    }

    #[tokio::test]
    async fn test_address_is_validated() {
        let items = items();
        let err = items.put(&[], "k", json!(1)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Validation { .. }));
        let err = items.get(&ns(&["a"]), "").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Validation { .. }));
    }
}
