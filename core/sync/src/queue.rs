//! Durable, ordered queue of offline actions.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use scoresync_common::{ActionId, ConflictId, DeviceId, Error, Result, RetryConfig};
use scoresync_store::{decode, encode, DurableStore, IndexFilter, Table, WriteBatch};

use crate::action::{ActionPayload, ActionStatus, OfflineAction};
use crate::record::{DomainRecord, RecordStore};
use crate::retry::Backoff;
use crate::rules::PayloadValidator;

const SEQUENCE_KEY: &str = "action_seq";

/// Compare-and-swap attempts before giving up on a contended write.
const MAX_SWAP_ATTEMPTS: u32 = 32;

/// Action queue backed by the durable store.
///
/// Every method reads and writes through the store, so several queue
/// instances over one store (one per context) stay consistent.
pub struct ActionQueue {
    store: Arc<dyn DurableStore>,
    device_id: DeviceId,
    validators: Vec<Arc<dyn PayloadValidator>>,
    retry: RetryConfig,
}

impl ActionQueue {
    /// Create a queue for this device.
    pub fn new(store: Arc<dyn DurableStore>, device_id: DeviceId, retry: RetryConfig) -> Self {
        Self {
            store,
            device_id,
            validators: Vec::new(),
            retry,
        }
    }

    /// Add a domain rule checked before every enqueue.
    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Queue a mutation.
    ///
    /// The payload is checked before anything is written. The action, the
    /// local record update and the sequence bump land in one atomic batch.
    ///
    /// # Errors
    /// - `Error::Validation` for malformed or rule-breaking payloads
    /// - `Error::Storage` if the durable store cannot be written
    pub async fn enqueue(&self, payload: ActionPayload) -> Result<OfflineAction> {
        self.enqueue_with(payload, None, |_| Ok(WriteBatch::new()))
            .await
    }

    /// Queue a mutation with an explicit version token and extra writes that
    /// must commit atomically with it. `extra` is rebuilt for every attempt
    /// from the action about to be written.
    ///
    /// If the preconditions in `extra` keep failing the call gives up with
    /// `Error::Conflict`.
    pub async fn enqueue_with<F>(
        &self,
        payload: ActionPayload,
        version_token: Option<DateTime<Utc>>,
        extra: F,
    ) -> Result<OfflineAction>
    where
        F: Fn(&OfflineAction) -> Result<WriteBatch>,
    {
        payload.check_structure()?;
        for validator in &self.validators {
            validator.validate(&payload)?;
        }
        let resource = payload.resource()?;
        let record_key = resource.storage_key();

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let now = Utc::now();
            let seq_raw = self.store.get(Table::Meta, SEQUENCE_KEY).await?;
            let sequence = seq_raw.as_ref().and_then(Value::as_u64).unwrap_or(0) + 1;
            let record_raw = self.store.get(Table::DomainRecords, &record_key).await?;

            let mut record = match &record_raw {
                Some(value) => decode::<DomainRecord>(value.clone())?,
                None => DomainRecord::local(resource.clone(), now),
            };
            record.apply_local(&payload, now)?;

            let mut action =
                OfflineAction::new(payload.clone(), self.device_id.clone(), sequence, now)?;
            action.version_token = version_token;

            let batch = WriteBatch::new()
                .expect(Table::Meta, SEQUENCE_KEY, seq_raw)
                .expect(Table::DomainRecords, record_key.clone(), record_raw)
                .put(Table::Meta, SEQUENCE_KEY, json!(sequence))
                .put(Table::Actions, action.id.as_str(), encode(&action)?);
            let batch = RecordStore::stage(batch, &record)?.merge(extra(&action)?);

            if self.store.apply(batch).await? {
                info!(
                    "Queued {} {} for {} (seq {})",
                    action.kind, action.id, action.resource, action.sequence
                );
                return Ok(action);
            }
            debug!("Enqueue for {} raced another writer, retrying", resource);
        }

        Err(Error::Conflict(format!(
            "could not enqueue for {}: store kept changing",
            resource
        )))
    }

    pub async fn get(&self, id: &ActionId) -> Result<Option<OfflineAction>> {
        self.store
            .get(Table::Actions, id.as_str())
            .await?
            .map(decode)
            .transpose()
    }

    /// Every action, FIFO ordered.
    pub async fn list_all(&self) -> Result<Vec<OfflineAction>> {
        self.collect(None).await
    }

    /// Actions in one status, FIFO ordered.
    pub async fn list_by_status(&self, status: ActionStatus) -> Result<Vec<OfflineAction>> {
        self.collect(Some(IndexFilter::field("status", status.as_str())))
            .await
    }

    /// Pending actions by `created_at` ascending.
    pub async fn list_pending(&self) -> Result<Vec<OfflineAction>> {
        self.list_by_status(ActionStatus::Pending).await
    }

    /// Pending actions whose backoff has elapsed.
    pub async fn list_ready(&self, now: DateTime<Utc>) -> Result<Vec<OfflineAction>> {
        Ok(self
            .list_pending()
            .await?
            .into_iter()
            .filter(|a| a.is_ready(now))
            .collect())
    }

    /// Actions not yet settled with the authority.
    pub async fn list_outstanding(&self) -> Result<Vec<OfflineAction>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(OfflineAction::is_outstanding)
            .collect())
    }

    /// Actions parked behind a given conflict.
    pub async fn list_for_conflict(&self, conflict_id: &ConflictId) -> Result<Vec<OfflineAction>> {
        Ok(self
            .list_by_status(ActionStatus::Conflict)
            .await?
            .into_iter()
            .filter(|a| a.conflict_id.as_ref() == Some(conflict_id))
            .collect())
    }

    /// Actions waiting to be submitted or in flight.
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self
            .list_all()
            .await?
            .iter()
            .filter(|a| matches!(a.status, ActionStatus::Pending | ActionStatus::Syncing))
            .count())
    }

    pub async fn mark_syncing(&self, id: &ActionId) -> Result<OfflineAction> {
        self.update(id, |action, now| action.mark_syncing(now)).await
    }

    /// Flip the status only; the record is left untouched.
    pub async fn mark_synced(&self, id: &ActionId) -> Result<OfflineAction> {
        self.update(id, |action, now| action.mark_synced(now)).await
    }

    /// Record the authority's acceptance of an action.
    ///
    /// The action, the record acknowledgement and `extra` commit atomically.
    /// The record only counts as synced when no other action for the same
    /// resource is outstanding.
    pub async fn commit_synced(
        &self,
        id: &ActionId,
        last_modified: DateTime<Utc>,
        server_fields: Map<String, Value>,
        extra: WriteBatch,
    ) -> Result<(OfflineAction, DomainRecord)> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let now = Utc::now();
            let action_raw = self.store.get(Table::Actions, id.as_str()).await?;
            let mut action: OfflineAction = match &action_raw {
                Some(value) => decode(value.clone())?,
                None => return Err(Error::NotFound(format!("action {}", id))),
            };
            let record_key = action.resource.storage_key();
            let record_raw = self.store.get(Table::DomainRecords, &record_key).await?;
            let mut record = match &record_raw {
                Some(value) => decode::<DomainRecord>(value.clone())?,
                None => DomainRecord::local(action.resource.clone(), now),
            };

            let settled = !self
                .list_outstanding()
                .await?
                .iter()
                .any(|other| other.id != action.id && other.resource == action.resource);
            record.accept(last_modified, server_fields.clone(), settled);
            action.mark_synced(now);

            let batch = WriteBatch::new()
                .expect(Table::Actions, id.as_str(), action_raw)
                .expect(Table::DomainRecords, record_key, record_raw)
                .put(Table::Actions, id.as_str(), encode(&action)?);
            let batch = RecordStore::stage(batch, &record)?.merge(extra.clone());

            if self.store.apply(batch).await? {
                return Ok((action, record));
            }
            debug!("Commit of {} raced another writer, retrying", id);
        }

        Err(Error::Conflict(format!("could not commit action {}", id)))
    }

    /// Record a transient failure.
    ///
    /// The action goes back to pending with an exponential backoff, or to
    /// failed once `max_attempts` submissions have failed.
    pub async fn mark_failed(&self, id: &ActionId, error: &Error) -> Result<OfflineAction> {
        let retry = self.retry.clone();
        let message = error.to_string();
        let action = self
            .update(id, |action, now| {
                let retry_in = if action.retry_count + 1 >= retry.max_attempts {
                    None
                } else {
                    Some(retry.delay_for_attempt(action.retry_count))
                };
                action.mark_failed(message.clone(), retry_in, now);
            })
            .await?;

        if action.status == ActionStatus::Failed {
            warn!(
                "Action {} failed {} times, giving up: {}",
                action.id, action.retry_count, message
            );
        }
        Ok(action)
    }

    /// Record a permanent rejection (no retry).
    pub async fn mark_rejected(&self, id: &ActionId, error: &Error) -> Result<OfflineAction> {
        let message = error.to_string();
        self.update(id, |action, now| action.mark_rejected(message.clone(), now))
            .await
    }

    pub async fn mark_conflict(
        &self,
        id: &ActionId,
        conflict_id: &ConflictId,
    ) -> Result<OfflineAction> {
        self.update(id, |action, now| action.mark_conflict(conflict_id.clone(), now))
            .await
    }

    /// Put every `syncing` action back to `pending`.
    pub async fn revert_syncing(&self) -> Result<usize> {
        let stuck = self.list_by_status(ActionStatus::Syncing).await?;
        for action in &stuck {
            self.update(&action.id, |a, now| a.revert_to_pending(now))
                .await?;
        }
        if !stuck.is_empty() {
            info!("Reverted {} syncing actions to pending", stuck.len());
        }
        Ok(stuck.len())
    }

    /// Put one action back to `pending` if it is still `syncing`.
    pub async fn revert_claimed(&self, id: &ActionId) -> Result<bool> {
        match self.get(id).await? {
            Some(action) if action.status == ActionStatus::Syncing => {
                self.update(id, |a, now| a.revert_to_pending(now)).await?;
                debug!("Reverted {} to pending", id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Manual retry of a failed action.
    pub async fn requeue_failed(&self, id: &ActionId) -> Result<OfflineAction> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("action {}", id)))?;
        if current.status != ActionStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "action {} is {}, only failed actions can be requeued",
                id, current.status
            )));
        }
        self.update(id, |action, now| action.requeue(now)).await
    }

    /// Delete synced actions older than the retention window.
    pub async fn prune_synced(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::zero());
        let mut pruned = 0;
        for action in self.list_by_status(ActionStatus::Synced).await? {
            if action.updated_at <= cutoff {
                self.store.delete(Table::Actions, action.id.as_str()).await?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Pruned {} synced actions", pruned);
        }
        Ok(pruned)
    }

    /// Add a guarded write of `action` to a batch, expecting `previous`.
    pub fn stage(
        batch: WriteBatch,
        previous: &OfflineAction,
        action: &OfflineAction,
    ) -> Result<WriteBatch> {
        Ok(batch
            .expect(Table::Actions, previous.id.as_str(), Some(encode(previous)?))
            .put(Table::Actions, action.id.as_str(), encode(action)?))
    }

    /// Read-modify-write of one action.
    async fn update<F>(&self, id: &ActionId, mut change: F) -> Result<OfflineAction>
    where
        F: FnMut(&mut OfflineAction, DateTime<Utc>),
    {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let raw = self
                .store
                .get(Table::Actions, id.as_str())
                .await?
                .ok_or_else(|| Error::NotFound(format!("action {}", id)))?;
            let mut action: OfflineAction = decode(raw.clone())?;
            change(&mut action, Utc::now());

            let batch = WriteBatch::new()
                .expect(Table::Actions, id.as_str(), Some(raw))
                .put(Table::Actions, id.as_str(), encode(&action)?);
            if self.store.apply(batch).await? {
                debug!("Action {} is now {}", id, action.status);
                return Ok(action);
            }
        }
        Err(Error::Conflict(format!("could not update action {}", id)))
    }

    async fn collect(&self, filter: Option<IndexFilter>) -> Result<Vec<OfflineAction>> {
        let mut actions = self
            .store
            .get_all(Table::Actions, filter)
            .await?
            .into_iter()
            .map(|row| decode::<OfflineAction>(row.value))
            .collect::<Result<Vec<_>>>()?;
        actions.sort_by_key(OfflineAction::fifo_key);
        Ok(actions)
    }
}
