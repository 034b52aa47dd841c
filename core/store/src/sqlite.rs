//! SQLite-backed durable store.
//!
//! One SQL table per logical [`Table`]; documents are stored as JSON text.
//! The schema version lives in `PRAGMA user_version`.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use scoresync_common::{Error, Result};

use crate::store::{DurableStore, IndexFilter, StoredRecord, Table, WriteBatch, WriteOp};

/// Current persisted layout version.
pub const SCHEMA_VERSION: i64 = 1;

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

fn parse_document(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| Error::Serialization(e.to_string()))
}

/// Durable store on a SQLite database file.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database cannot be opened
    /// - Schema creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        // Other contexts may hold the write lock briefly.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(storage_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(storage_err)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migrate(&mut conn)?;
        info!("SQLite store opened (schema v{})", SCHEMA_VERSION);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Storage(format!("store task failed: {}", e)))?
    }
}

/// Read the stored schema version.
fn schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(storage_err)
}

/// Bring the schema up to [`SCHEMA_VERSION`].
///
/// A database written by a newer, unknown layout is wiped and recreated.
fn migrate(conn: &mut Connection) -> Result<()> {
    let version = schema_version(conn)?;

    if version > SCHEMA_VERSION {
        warn!(
            "Store schema v{} is newer than supported v{}, wiping local data",
            version, SCHEMA_VERSION
        );
        wipe(conn)?;
        return migrate_v1(conn);
    }

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration to version 1: one document table per logical table.
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction().map_err(storage_err)?;
    for table in Table::ALL {
        tx.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {name} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
            name = table.as_str()
        ))
        .map_err(storage_err)?;
    }
    tx.pragma_update(None, "user_version", 1).map_err(storage_err)?;
    tx.commit().map_err(storage_err)?;
    debug!("Applied store migration v1");
    Ok(())
}

fn wipe(conn: &mut Connection) -> Result<()> {
    let names: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;
        rows.collect::<std::result::Result<_, _>>()
            .map_err(storage_err)?
    };

    let tx = conn.transaction().map_err(storage_err)?;
    for name in names {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", name.replace('"', "\"\"")))
            .map_err(storage_err)?;
    }
    tx.pragma_update(None, "user_version", 0).map_err(storage_err)?;
    tx.commit().map_err(storage_err)?;
    Ok(())
}

fn read_value(conn: &Connection, table: Table, key: &str) -> Result<Option<Value>> {
    let text: Option<String> = conn
        .query_row(
            &format!("SELECT value FROM {} WHERE key = ?1", table.as_str()),
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    text.as_deref().map(parse_document).transpose()
}

fn write_value(conn: &Connection, table: Table, key: &str, value: &Value) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (key, value, updated_at) VALUES (?1, ?2, ?3)",
            table.as_str()
        ),
        params![key, value.to_string(), now_millis()],
    )
    .map_err(storage_err)?;
    Ok(())
}

#[async_trait]
impl DurableStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn put(&self, table: Table, key: &str, value: Value) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| write_value(conn, table, &key, &value))
            .await
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<Value>> {
        let key = key.to_string();
        self.with_conn(move |conn| read_value(conn, table, &key)).await
    }

    async fn get_all(&self, table: Table, filter: Option<IndexFilter>) -> Result<Vec<StoredRecord>> {
        self.with_conn(move |conn| {
            let (sql, prefix) = match &filter {
                Some(IndexFilter::KeyPrefix(prefix)) => (
                    format!(
                        "SELECT key, value FROM {} WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                        table.as_str()
                    ),
                    Some(prefix.clone()),
                ),
                _ => (
                    format!("SELECT key, value FROM {} ORDER BY key", table.as_str()),
                    None,
                ),
            };

            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let mapper = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String)> {
                Ok((row.get(0)?, row.get(1)?))
            };
            let rows: Vec<(String, String)> = match prefix {
                Some(prefix) => stmt
                    .query_map(params![prefix], mapper)
                    .map_err(storage_err)?
                    .collect::<std::result::Result<_, _>>(),
                None => stmt
                    .query_map([], mapper)
                    .map_err(storage_err)?
                    .collect::<std::result::Result<_, _>>(),
            }
            .map_err(storage_err)?;

            let mut result = Vec::with_capacity(rows.len());
            for (key, text) in rows {
                let value = parse_document(&text)?;
                if filter.as_ref().map_or(true, |f| f.matches(&key, &value)) {
                    result.push(StoredRecord { key, value });
                }
            }
            Ok(result)
        })
        .await
    }

    async fn delete(&self, table: Table, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                &format!("DELETE FROM {} WHERE key = ?1", table.as_str()),
                params![key],
            )
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<bool> {
        self.with_conn(move |conn| {
            // IMMEDIATE takes the write lock before preconditions are read,
            // so another connection cannot slip in between check and write.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(storage_err)?;

            for op in batch.ops() {
                if let WriteOp::Expect { table, key, value } = op {
                    let current = read_value(&tx, *table, key)?;
                    if current.as_ref() != value.as_ref() {
                        debug!("Batch precondition failed on {}/{}", table, key);
                        return Ok(false);
                    }
                }
            }

            for op in batch.into_ops() {
                match op {
                    WriteOp::Put { table, key, value } => write_value(&tx, table, &key, &value)?,
                    WriteOp::Delete { table, key } => {
                        tx.execute(
                            &format!("DELETE FROM {} WHERE key = ?1", table.as_str()),
                            params![key],
                        )
                        .map_err(storage_err)?;
                    }
                    WriteOp::Expect { .. } => {}
                }
            }

            tx.commit().map_err(storage_err)?;
            Ok(true)
        })
        .await
    }

    async fn clear(&self, table: Table) -> Result<usize> {
        self.with_conn(move |conn| {
            conn.execute(&format!("DELETE FROM {}", table.as_str()), [])
                .map_err(storage_err)
        })
        .await
    }

    async fn count(&self, table: Table) -> Result<usize> {
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table.as_str()), [], |row| {
                    row.get(0)
                })
                .map_err(storage_err)?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_operations() {
        let store = SqliteStore::in_memory().unwrap();

        store
            .put(Table::DomainRecords, "scores/1", json!({"value": 7.5}))
            .await
            .unwrap();
        let value = store.get(Table::DomainRecords, "scores/1").await.unwrap();
        assert_eq!(value, Some(json!({"value": 7.5})));

        store.delete(Table::DomainRecords, "scores/1").await.unwrap();
        assert!(store.get(Table::DomainRecords, "scores/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefix_listing() {
        let store = SqliteStore::in_memory().unwrap();
        store.put(Table::CacheEntries, "/api/scores", json!(1)).await.unwrap();
        store.put(Table::CacheEntries, "/api/scores/9", json!(2)).await.unwrap();
        store.put(Table::CacheEntries, "/static/app.css", json!(3)).await.unwrap();

        let rows = store
            .get_all(Table::CacheEntries, Some(IndexFilter::KeyPrefix("/api/".to_string())))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(store.count(Table::CacheEntries).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let store = SqliteStore::in_memory().unwrap();
        store.put(Table::Leases, "drain", json!({"holder": "a"})).await.unwrap();

        let stale = WriteBatch::new()
            .expect(Table::Leases, "drain", None)
            .put(Table::Leases, "drain", json!({"holder": "b"}))
            .put(Table::Actions, "x", json!({}));
        assert!(!store.apply(stale).await.unwrap());
        assert!(store.get(Table::Actions, "x").await.unwrap().is_none());

        let fresh = WriteBatch::new()
            .expect(Table::Leases, "drain", Some(json!({"holder": "a"})))
            .delete(Table::Leases, "drain")
            .put(Table::Actions, "x", json!({}));
        assert!(store.apply(fresh).await.unwrap());
        assert!(store.get(Table::Leases, "drain").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(Table::Meta, "device_id", json!("tablet-1")).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get(Table::Meta, "device_id").await.unwrap(),
            Some(json!("tablet-1"))
        );
    }

    #[test]
    fn test_newer_schema_is_wiped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE future_stuff (x INTEGER); PRAGMA user_version = 99;")
                .unwrap();
        }

        let _store = SqliteStore::open(&path).unwrap();
        let conn = Connection::open(&path).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let leftover: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'future_stuff'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(leftover, 0);
    }
}
