//! Durable store trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use scoresync_common::{Error, Result};

/// Logical tables of the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Queued offline actions.
    Actions,
    /// Local copies of domain records, keyed `type/id`.
    DomainRecords,
    /// Open and recently resolved conflicts.
    Conflicts,
    /// Cached remote resources.
    CacheEntries,
    /// Installation metadata (device id, counters).
    Meta,
    /// Cross-context leases.
    Leases,
}

impl Table {
    /// Every table, in schema order.
    pub const ALL: [Table; 6] = [
        Table::Actions,
        Table::DomainRecords,
        Table::Conflicts,
        Table::CacheEntries,
        Table::Meta,
        Table::Leases,
    ];

    /// Stable table name used in the persisted layout.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Actions => "actions",
            Table::DomainRecords => "domain_records",
            Table::Conflicts => "conflicts",
            Table::CacheEntries => "cache_entries",
            Table::Meta => "meta",
            Table::Leases => "leases",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter applied by [`DurableStore::get_all`].
#[derive(Debug, Clone, PartialEq)]
pub enum IndexFilter {
    /// Top-level field of the stored document equals `value`.
    FieldEquals { field: String, value: Value },
    /// Record key starts with the prefix.
    KeyPrefix(String),
}

impl IndexFilter {
    /// Filter on a top-level document field.
    pub fn field(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Check whether a record passes the filter.
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        match self {
            IndexFilter::FieldEquals { field, value: expected } => {
                value.get(field).is_some_and(|actual| actual == expected)
            }
            IndexFilter::KeyPrefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

/// A key/value pair read back from a table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: String,
    pub value: Value,
}

/// A single operation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace.
    Put { table: Table, key: String, value: Value },
    /// Remove if present.
    Delete { table: Table, key: String },
    /// Precondition: the current value must equal `value` (`None` = absent).
    Expect {
        table: Table,
        key: String,
        value: Option<Value>,
    },
}

/// Atomic group of writes with optional preconditions.
///
/// Preconditions are checked first; if any fails nothing is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an insert-or-replace.
    pub fn put(mut self, table: Table, key: impl Into<String>, value: Value) -> Self {
        self.ops.push(WriteOp::Put {
            table,
            key: key.into(),
            value,
        });
        self
    }

    /// Add a delete.
    pub fn delete(mut self, table: Table, key: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete {
            table,
            key: key.into(),
        });
        self
    }

    /// Add a precondition on the current value of a record.
    pub fn expect(mut self, table: Table, key: impl Into<String>, value: Option<Value>) -> Self {
        self.ops.push(WriteOp::Expect {
            table,
            key: key.into(),
            value,
        });
        self
    }

    /// Append every operation of `other`.
    pub fn merge(mut self, other: WriteBatch) -> Self {
        self.ops.extend(other.ops);
        self
    }

    /// Operations in insertion order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Durable store trait for the different backends.
///
/// All operations are async. Implementations must make [`DurableStore::apply`]
/// atomic relative to crash and reload: a reader never observes half a batch.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Whether the medium is usable. When `false`, every operation fails
    /// with `Error::Storage` and callers run without offline capability.
    fn is_available(&self) -> bool {
        true
    }

    /// Insert or replace a record.
    async fn put(&self, table: Table, key: &str, value: Value) -> Result<()>;

    /// Read a record.
    async fn get(&self, table: Table, key: &str) -> Result<Option<Value>>;

    /// Read every record of a table, ordered by key.
    async fn get_all(&self, table: Table, filter: Option<IndexFilter>) -> Result<Vec<StoredRecord>>;

    /// Remove a record. Removing a missing record is not an error.
    async fn delete(&self, table: Table, key: &str) -> Result<()>;

    /// Apply a batch atomically.
    ///
    /// # Returns
    /// - `Ok(true)` if every precondition held and all writes were applied
    /// - `Ok(false)` if a precondition failed; nothing was written
    async fn apply(&self, batch: WriteBatch) -> Result<bool>;

    /// Remove every record of a table, returning how many were removed.
    async fn clear(&self, table: Table) -> Result<usize>;

    /// Number of records in a table.
    async fn count(&self, table: Table) -> Result<usize> {
        Ok(self.get_all(table, None).await?.len())
    }
}

/// Serialize a value into a store document.
pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Deserialize a store document.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_filter() {
        let filter = IndexFilter::field("status", "pending");
        assert!(filter.matches("a", &json!({"status": "pending"})));
        assert!(!filter.matches("a", &json!({"status": "synced"})));
        assert!(!filter.matches("a", &json!({"other": 1})));
    }

    #[test]
    fn test_prefix_filter() {
        let filter = IndexFilter::KeyPrefix("scores/".to_string());
        assert!(filter.matches("scores/1", &Value::Null));
        assert!(!filter.matches("evaluations/1", &Value::Null));
    }

    #[test]
    fn test_batch_builder_keeps_order() {
        let batch = WriteBatch::new()
            .expect(Table::Meta, "seq", None)
            .put(Table::Meta, "seq", json!(1))
            .delete(Table::Actions, "a");
        assert_eq!(batch.ops().len(), 3);
        assert!(matches!(batch.ops()[0], WriteOp::Expect { .. }));

        let merged = WriteBatch::new()
            .put(Table::Actions, "b", json!(2))
            .merge(batch);
        assert_eq!(merged.ops().len(), 4);
        assert!(matches!(merged.ops()[1], WriteOp::Expect { .. }));
    }

    #[test]
    fn test_table_names_are_stable() {
        assert_eq!(Table::DomainRecords.as_str(), "domain_records");
        assert_eq!(Table::CacheEntries.to_string(), "cache_entries");
    }
}
