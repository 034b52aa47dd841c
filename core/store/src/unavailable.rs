//! Stand-in store for a medium that could not be opened.

use async_trait::async_trait;
use serde_json::Value;

use scoresync_common::{Error, Result};

use crate::store::{DurableStore, IndexFilter, StoredRecord, Table, WriteBatch};

/// Store that reports `Error::Storage` for every operation.
///
/// Components built on top of it keep working online-only.
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> Error {
        Error::Storage(format!("durable store unavailable: {}", self.reason))
    }
}

#[async_trait]
impl DurableStore for UnavailableStore {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn put(&self, _table: Table, _key: &str, _value: Value) -> Result<()> {
        Err(self.error())
    }

    async fn get(&self, _table: Table, _key: &str) -> Result<Option<Value>> {
        Err(self.error())
    }

    async fn get_all(&self, _table: Table, _filter: Option<IndexFilter>) -> Result<Vec<StoredRecord>> {
        Err(self.error())
    }

    async fn delete(&self, _table: Table, _key: &str) -> Result<()> {
        Err(self.error())
    }

    async fn apply(&self, _batch: WriteBatch) -> Result<bool> {
        Err(self.error())
    }

    async fn clear(&self, _table: Table) -> Result<usize> {
        Err(self.error())
    }
}
