//! Local copies of domain records (scores, evaluations).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use scoresync_common::{ResourceKey, Result};
use scoresync_store::{decode, encode, DurableStore, IndexFilter, Table, WriteBatch};

use crate::action::ActionPayload;

/// The client's view of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub resource: ResourceKey,
    /// Current local state, including unconfirmed mutations.
    pub fields: Map<String, Value>,
    /// Authority-assigned version token of the last acknowledged state.
    pub last_modified: Option<DateTime<Utc>>,
    /// Last acknowledged state. Base for three-way merges.
    pub server_fields: Option<Map<String, Value>>,
    pub local_modified_at: DateTime<Utc>,
    pub is_synced: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl DomainRecord {
    /// A record never seen before, neither locally nor remotely.
    pub fn local(resource: ResourceKey, now: DateTime<Utc>) -> Self {
        Self {
            resource,
            fields: Map::new(),
            last_modified: None,
            server_fields: None,
            local_modified_at: now,
            is_synced: false,
            deleted: false,
        }
    }

    /// A record exactly as the authority holds it.
    pub fn from_server(
        resource: ResourceKey,
        fields: Map<String, Value>,
        last_modified: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            resource,
            fields: fields.clone(),
            last_modified: Some(last_modified),
            server_fields: Some(fields),
            local_modified_at: now,
            is_synced: true,
            deleted: false,
        }
    }

    /// Apply an unconfirmed local mutation.
    pub fn apply_local(&mut self, payload: &ActionPayload, now: DateTime<Utc>) -> Result<()> {
        if payload.is_delete() {
            self.fields.clear();
            self.deleted = true;
        } else {
            self.fields = payload.to_fields()?;
            self.deleted = false;
        }
        self.is_synced = false;
        self.local_modified_at = now;
        Ok(())
    }

    /// Record the authority's acknowledgement.
    ///
    /// With `settled` (no other local mutation outstanding) the local state
    /// becomes the acknowledged state; otherwise local fields are kept.
    pub fn accept(
        &mut self,
        last_modified: DateTime<Utc>,
        server_fields: Map<String, Value>,
        settled: bool,
    ) {
        self.last_modified = Some(last_modified);
        if settled {
            if !self.deleted {
                self.fields = server_fields.clone();
            }
            self.is_synced = true;
        }
        self.server_fields = Some(server_fields);
    }
}

/// Typed access to the `domain_records` table.
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn DurableStore>,
}

impl RecordStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, resource: &ResourceKey) -> Result<Option<DomainRecord>> {
        Ok(self.get_raw(resource).await?.map(decode).transpose()?)
    }

    /// Stored document, for compare-and-swap preconditions.
    pub async fn get_raw(&self, resource: &ResourceKey) -> Result<Option<Value>> {
        self.store
            .get(Table::DomainRecords, &resource.storage_key())
            .await
    }

    /// Every record of one resource type, ordered by id.
    pub async fn list(&self, resource_type: &str) -> Result<Vec<DomainRecord>> {
        self.store
            .get_all(
                Table::DomainRecords,
                Some(IndexFilter::KeyPrefix(format!("{}/", resource_type))),
            )
            .await?
            .into_iter()
            .map(|row| decode(row.value))
            .collect()
    }

    pub async fn put(&self, record: &DomainRecord) -> Result<()> {
        self.store
            .put(
                Table::DomainRecords,
                &record.resource.storage_key(),
                encode(record)?,
            )
            .await
    }

    /// Add a write of `record` to a batch.
    pub fn stage(batch: WriteBatch, record: &DomainRecord) -> Result<WriteBatch> {
        Ok(batch.put(
            Table::DomainRecords,
            record.resource.storage_key(),
            encode(record)?,
        ))
    }
}
