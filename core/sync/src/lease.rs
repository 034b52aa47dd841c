//! Cross-context drain lease kept in the durable store.
//!
//! Contexts sharing one store cannot share memory, so single-flight draining
//! is coordinated through a lease record updated by compare-and-swap. A lease
//! that is not renewed expires, which lets a crashed holder be taken over.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use scoresync_common::Result;
use scoresync_store::{decode, encode, DurableStore, Table, WriteBatch};

const DRAIN_LEASE: &str = "drain";

/// Stored lease document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One context's handle on the store-wide drain lease.
pub struct DrainLease {
    store: Arc<dyn DurableStore>,
    holder: String,
    ttl: ChronoDuration,
}

impl DrainLease {
    /// Create a handle with a fresh holder id.
    pub fn new(store: Arc<dyn DurableStore>, ttl: Duration) -> Self {
        Self {
            store,
            holder: Uuid::new_v4().to_string(),
            ttl: ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(60)),
        }
    }

    /// Holder id of this context.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Current lease, if any.
    pub async fn current(&self) -> Result<Option<LeaseRecord>> {
        self.store
            .get(Table::Leases, DRAIN_LEASE)
            .await?
            .map(decode)
            .transpose()
    }

    /// Take the lease unless another live holder has it.
    pub async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();
        let raw = self.store.get(Table::Leases, DRAIN_LEASE).await?;
        if let Some(value) = &raw {
            let lease: LeaseRecord = decode(value.clone())?;
            if lease.holder != self.holder && !lease.is_expired(now) {
                debug!("Drain lease held by {} until {}", lease.holder, lease.expires_at);
                return Ok(false);
            }
        }
        self.swap(raw, now).await
    }

    /// Extend the lease if this context still holds it.
    pub async fn renew(&self) -> Result<bool> {
        let raw = self.store.get(Table::Leases, DRAIN_LEASE).await?;
        match &raw {
            Some(value) if decode::<LeaseRecord>(value.clone())?.holder == self.holder => {
                self.swap(raw, Utc::now()).await
            }
            _ => Ok(false),
        }
    }

    /// Give the lease up. A lease held by someone else is left alone.
    pub async fn release(&self) -> Result<()> {
        let raw = self.store.get(Table::Leases, DRAIN_LEASE).await?;
        if let Some(value) = raw {
            if decode::<LeaseRecord>(value.clone())?.holder == self.holder {
                let batch = WriteBatch::new()
                    .expect(Table::Leases, DRAIN_LEASE, Some(value))
                    .delete(Table::Leases, DRAIN_LEASE);
                self.store.apply(batch).await?;
            }
        }
        Ok(())
    }

    async fn swap(&self, expected: Option<serde_json::Value>, now: DateTime<Utc>) -> Result<bool> {
        let acquired_at = match &expected {
            Some(value) => match decode::<LeaseRecord>(value.clone())? {
                lease if lease.holder == self.holder => lease.acquired_at,
                _ => now,
            },
            None => now,
        };
        let lease = LeaseRecord {
            holder: self.holder.clone(),
            acquired_at,
            expires_at: now + self.ttl,
        };
        let batch = WriteBatch::new()
            .expect(Table::Leases, DRAIN_LEASE, expected)
            .put(Table::Leases, DRAIN_LEASE, encode(&lease)?);
        self.store.apply(batch).await
    }
}
