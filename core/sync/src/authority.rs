//! Remote authority abstraction.
//!
//! The authority owns the canonical version of every record and accepts or
//! rejects writes by optimistic concurrency: a write carries the version
//! token it was based on and is rejected if the record moved on since.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use scoresync_common::{ActionId, DeviceId, Error, ResourceKey, Result};

use crate::action::{ActionPayload, OfflineAction};

/// One write sent to the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub action_id: ActionId,
    pub device_id: DeviceId,
    pub resource: ResourceKey,
    pub payload: ActionPayload,
    /// Version token the write is based on. `None` for records the client
    /// has never seen acknowledged.
    pub base_version: Option<DateTime<Utc>>,
    pub client_modified_at: DateTime<Utc>,
}

impl SubmitRequest {
    /// Build the request for a queued action.
    pub fn for_action(action: &OfflineAction, base_version: Option<DateTime<Utc>>) -> Self {
        Self {
            action_id: action.id.clone(),
            device_id: action.device_id.clone(),
            resource: action.resource.clone(),
            payload: action.payload.clone(),
            base_version,
            client_modified_at: action.created_at,
        }
    }
}

/// The authority's answer to a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Written. `last_modified` is the new version token.
    Accepted {
        last_modified: DateTime<Utc>,
        fields: Map<String, Value>,
    },
    /// The base version is stale.
    VersionMismatch {
        server_fields: Map<String, Value>,
        server_last_modified: DateTime<Utc>,
    },
}

/// A record as the authority holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub resource: ResourceKey,
    pub fields: Map<String, Value>,
    pub last_modified: DateTime<Utc>,
}

/// Remote authority trait for the different transports.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Transport name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Submit one write.
    ///
    /// # Errors
    /// - `Error::Network` / `Error::Timeout` for transient transport failures
    /// - `Error::Validation` if the authority rejects the payload outright
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome>;

    /// Current authoritative state of a record.
    async fn fetch_record(&self, resource: &ResourceKey) -> Result<Option<RemoteRecord>>;
}

#[derive(Default)]
struct AuthorityState {
    records: HashMap<ResourceKey, RemoteRecord>,
    submissions: Vec<SubmitRequest>,
    accepted: HashMap<ActionId, DateTime<Utc>>,
    fail_next: u32,
    delay: Option<Duration>,
    last_issued: Option<DateTime<Utc>>,
}

impl AuthorityState {
    /// Strictly increasing version tokens, even within one clock tick.
    fn next_version(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_issued {
            Some(last) if last >= now => last + ChronoDuration::milliseconds(1),
            _ => now,
        };
        self.last_issued = Some(next);
        next
    }
}

/// In-process authority for tests and demos.
#[derive(Default)]
pub struct MemoryAuthority {
    state: Mutex<AuthorityState>,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, AuthorityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` submissions with `Error::Network`.
    pub fn fail_next(&self, count: u32) {
        self.state().fail_next = count;
    }

    /// Delay every submission, e.g. to exercise timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Write a record as another device would. Returns its version token.
    pub fn seed(&self, resource: ResourceKey, fields: Map<String, Value>) -> DateTime<Utc> {
        let mut state = self.state();
        let last_modified = state.next_version();
        state.records.insert(
            resource.clone(),
            RemoteRecord {
                resource,
                fields,
                last_modified,
            },
        );
        last_modified
    }

    /// Current record, if any.
    pub fn record(&self, resource: &ResourceKey) -> Option<RemoteRecord> {
        self.state().records.get(resource).cloned()
    }

    /// Version token issued when `action` was accepted.
    pub fn accepted_version(&self, action: &ActionId) -> Option<DateTime<Utc>> {
        self.state().accepted.get(action).copied()
    }

    /// Every submission that reached the authority, in arrival order.
    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.state().submissions.clone()
    }
}

#[async_trait]
impl RemoteAuthority for MemoryAuthority {
    fn name(&self) -> &str {
        "memory"
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitOutcome> {
        let delay = {
            let mut state = self.state();
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(Error::Network("injected failure".to_string()));
            }
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.submissions.push(request.clone());

        if let Some(current) = state.records.get(&request.resource) {
            if request.base_version != Some(current.last_modified) {
                debug!(
                    "Rejecting {} for {}: base {:?}, current {}",
                    request.action_id, request.resource, request.base_version, current.last_modified
                );
                return Ok(SubmitOutcome::VersionMismatch {
                    server_fields: current.fields.clone(),
                    server_last_modified: current.last_modified,
                });
            }
        }

        let last_modified = state.next_version();
        state
            .accepted
            .insert(request.action_id.clone(), last_modified);
        if request.payload.is_delete() {
            state.records.remove(&request.resource);
            return Ok(SubmitOutcome::Accepted {
                last_modified,
                fields: Map::new(),
            });
        }

        let fields = request.payload.to_fields()?;
        state.records.insert(
            request.resource.clone(),
            RemoteRecord {
                resource: request.resource.clone(),
                fields: fields.clone(),
                last_modified,
            },
        );
        Ok(SubmitOutcome::Accepted {
            last_modified,
            fields,
        })
    }

    async fn fetch_record(&self, resource: &ResourceKey) -> Result<Option<RemoteRecord>> {
        Ok(self.record(resource))
    }
}
