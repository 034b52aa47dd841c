//! In-memory durable store for testing and ephemeral sessions.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use scoresync_common::{Error, Result};

use crate::store::{DurableStore, IndexFilter, StoredRecord, Table, WriteBatch, WriteOp};

type Tables = HashMap<Table, BTreeMap<String, Value>>;

/// In-memory store.
///
/// All data is lost on drop. Several components (or simulated contexts) can
/// share one instance through an `Arc`.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    /// Simulates a full or read-only medium.
    reject_writes: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            reject_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with `Error::Storage`.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory store is full".to_string()));
        }
        self.tables
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, table: Table, key: &str, value: Value) -> Result<()> {
        self.write()?
            .entry(table)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<Value>> {
        Ok(self
            .read()?
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn get_all(&self, table: Table, filter: Option<IndexFilter>) -> Result<Vec<StoredRecord>> {
        let tables = self.read()?;
        let Some(rows) = tables.get(&table) else {
            return Ok(Vec::new());
        };

        Ok(rows
            .iter()
            .filter(|(key, value)| filter.as_ref().map_or(true, |f| f.matches(key, value)))
            .map(|(key, value)| StoredRecord {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn delete(&self, table: Table, key: &str) -> Result<()> {
        if let Some(rows) = self.write()?.get_mut(&table) {
            rows.remove(key);
        }
        Ok(())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<bool> {
        let mut tables = self.write()?;

        for op in batch.ops() {
            if let WriteOp::Expect { table, key, value } = op {
                let current = tables.get(table).and_then(|rows| rows.get(key));
                if current != value.as_ref() {
                    return Ok(false);
                }
            }
        }

        for op in batch.into_ops() {
            match op {
                WriteOp::Put { table, key, value } => {
                    tables.entry(table).or_default().insert(key, value);
                }
                WriteOp::Delete { table, key } => {
                    if let Some(rows) = tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
                WriteOp::Expect { .. } => {}
            }
        }

        Ok(true)
    }

    async fn clear(&self, table: Table) -> Result<usize> {
        Ok(self
            .write()?
            .remove(&table)
            .map_or(0, |rows| rows.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put(Table::Actions, "a1", json!({"n": 1})).await.unwrap();

        assert_eq!(store.get(Table::Actions, "a1").await.unwrap(), Some(json!({"n": 1})));
        assert_eq!(store.get(Table::Conflicts, "a1").await.unwrap(), None);

        store.delete(Table::Actions, "a1").await.unwrap();
        assert_eq!(store.get(Table::Actions, "a1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_all_is_key_ordered_and_filtered() {
        let store = MemoryStore::new();
        store.put(Table::Actions, "b", json!({"status": "pending"})).await.unwrap();
        store.put(Table::Actions, "a", json!({"status": "pending"})).await.unwrap();
        store.put(Table::Actions, "c", json!({"status": "synced"})).await.unwrap();

        let all = store.get_all(Table::Actions, None).await.unwrap();
        let keys: Vec<_> = all.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        let pending = store
            .get_all(Table::Actions, Some(IndexFilter::field("status", "pending")))
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_precondition_writes_nothing() {
        let store = MemoryStore::new();
        store.put(Table::Meta, "seq", json!(4)).await.unwrap();

        let batch = WriteBatch::new()
            .expect(Table::Meta, "seq", Some(json!(3)))
            .put(Table::Meta, "seq", json!(4))
            .put(Table::Actions, "a", json!({}));
        assert!(!store.apply(batch).await.unwrap());
        assert_eq!(store.get(Table::Actions, "a").await.unwrap(), None);

        let batch = WriteBatch::new()
            .expect(Table::Meta, "seq", Some(json!(4)))
            .put(Table::Meta, "seq", json!(5))
            .put(Table::Actions, "a", json!({}));
        assert!(store.apply(batch).await.unwrap());
        assert_eq!(store.get(Table::Meta, "seq").await.unwrap(), Some(json!(5)));
    }

    #[tokio::test]
    async fn test_rejected_writes_surface_storage_error() {
        let store = MemoryStore::new();
        store.set_reject_writes(true);
        let err = store.put(Table::Actions, "a", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        // Reads keep working.
        assert!(store.get(Table::Actions, "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_counts_rows() {
        let store = MemoryStore::new();
        store.put(Table::CacheEntries, "/a", json!(1)).await.unwrap();
        store.put(Table::CacheEntries, "/b", json!(2)).await.unwrap();
        assert_eq!(store.count(Table::CacheEntries).await.unwrap(), 2);
        assert_eq!(store.clear(Table::CacheEntries).await.unwrap(), 2);
        assert_eq!(store.count(Table::CacheEntries).await.unwrap(), 0);
    }
}
