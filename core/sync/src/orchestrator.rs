//! Drains the action queue against the remote authority.
//!
//! Per action: `pending -> syncing -> synced | failed -> pending (retry) |
//! conflict`. One drain runs at a time per context, and a store lease keeps
//! other contexts sharing the store from draining concurrently.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scoresync_common::{ActionId, ConflictId, Error, ResourceKey, Result, SyncConfig};
use scoresync_store::{decode, encode, DurableStore, Table, WriteBatch};

use crate::action::{ActionPayload, ActionStatus, OfflineAction};
use crate::authority::{RemoteAuthority, SubmitOutcome, SubmitRequest};
use crate::cache::ResourceCache;
use crate::conflict::{
    differing_fields, Conflict, ConflictResolver, ConflictStore, Divergence, ResolutionStrategy,
};
use crate::connectivity::ConnectivityMonitor;
use crate::lease::DrainLease;
use crate::queue::ActionQueue;
use crate::record::{DomainRecord, RecordStore};
use crate::status::{StatusPublisher, SyncPhase};

const MAX_SWAP_ATTEMPTS: u32 = 32;

/// Why a drain did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    StoreUnavailable,
    /// Coalesced into the drain already running in this context.
    AlreadyRunning,
    /// Another context holds the store lease.
    LeaseHeld,
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub synced: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub passes: u32,
    pub skipped: Option<SkipReason>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl DrainReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

/// What happened to one submitted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Synced,
    Failed,
    Conflict,
    Cancelled,
}

/// Resets the in-flight flag when a drain ends, however it ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sync orchestrator.
pub struct SyncOrchestrator {
    store: Arc<dyn DurableStore>,
    queue: Arc<ActionQueue>,
    records: RecordStore,
    conflicts: ConflictStore,
    authority: Arc<dyn RemoteAuthority>,
    cache: Option<Arc<ResourceCache>>,
    monitor: Arc<ConnectivityMonitor>,
    status: Arc<StatusPublisher>,
    lease: DrainLease,
    config: SyncConfig,
    draining: AtomicBool,
    rerun: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn DurableStore>,
        queue: Arc<ActionQueue>,
        authority: Arc<dyn RemoteAuthority>,
        monitor: Arc<ConnectivityMonitor>,
        status: Arc<StatusPublisher>,
        config: SyncConfig,
    ) -> Self {
        Self {
            records: RecordStore::new(store.clone()),
            conflicts: ConflictStore::new(store.clone()),
            lease: DrainLease::new(store.clone(), config.lease_ttl),
            store,
            queue,
            authority,
            cache: None,
            monitor,
            status,
            config,
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }

    /// Invalidate cached reads of every resource the authority accepts.
    pub fn with_cache(mut self, cache: Arc<ResourceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn conflicts(&self) -> &ConflictStore {
        &self.conflicts
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Raw reachability signal.
    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Put actions left `syncing` by a crashed drain back to `pending`.
    pub async fn recover_stuck(&self) -> Result<usize> {
        if self.lease.current().await?.is_some_and(|l| !l.is_expired(Utc::now())) {
            debug!("Drain lease is live, leaving syncing actions alone");
            return Ok(0);
        }
        self.queue.revert_syncing().await
    }

    /// Abort the drain in flight, if any. Actions being submitted go back to
    /// `pending`.
    pub fn cancel_sync(&self) {
        let current = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = current.as_ref() {
            info!("Cancelling sync");
            token.cancel();
        }
    }

    /// Run one drain cycle.
    ///
    /// Errors are only returned for store failures; submission failures are
    /// recorded on the actions.
    pub async fn drain(&self) -> Result<DrainReport> {
        if !self.store.is_available() {
            self.status.update(|s| {
                s.phase = SyncPhase::Error;
                s.last_error = Some("durable store unavailable".to_string());
            });
            return Ok(DrainReport::skipped(SkipReason::StoreUnavailable));
        }
        if !self.monitor.is_online() {
            debug!("Offline, skipping drain");
            self.status.update(|s| {
                s.is_online = false;
                s.phase = SyncPhase::Offline;
            });
            return Ok(DrainReport::skipped(SkipReason::Offline));
        }
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("Drain already running, coalescing");
            self.rerun.store(true, Ordering::SeqCst);
            return Ok(DrainReport::skipped(SkipReason::AlreadyRunning));
        }
        let flight = FlightGuard(&self.draining);

        if !self.lease.try_acquire().await? {
            info!("Another context is draining, skipping");
            return Ok(DrainReport::skipped(SkipReason::LeaseHeld));
        }

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());

        let started = Instant::now();
        self.status.update(|s| {
            s.is_online = true;
            s.phase = SyncPhase::Syncing;
        });
        info!("Starting drain");

        let mut report = DrainReport::default();
        let mut in_flight = None;
        let result = loop {
            self.rerun.store(false, Ordering::SeqCst);
            if let Err(e) = self.run_passes(&token, &mut report, &mut in_flight).await {
                break Err(e);
            }
            if report.cancelled || !self.rerun.load(Ordering::SeqCst) {
                break Ok(());
            }
            debug!("Drain re-triggered while running, going again");
        };

        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = None;
        // Only the action this drain claimed goes back; others may belong to
        // the context that took the lease over.
        if let Some(id) = in_flight {
            if let Err(e) = self.queue.revert_claimed(&id).await {
                warn!("Could not revert action {}: {}", id, e);
            }
        }
        if let Err(e) = self.lease.release().await {
            warn!("Could not release drain lease: {}", e);
        }

        report.duration = started.elapsed();
        match &result {
            Ok(()) => info!(
                "Drain finished in {:?}: {} synced, {} failed, {} conflicts{}",
                report.duration,
                report.synced,
                report.failed,
                report.conflicts,
                if report.cancelled { " (cancelled)" } else { "" }
            ),
            Err(e) => error!("Drain aborted: {}", e),
        }

        drop(flight);
        let error = result.as_ref().err().map(ToString::to_string);
        self.refresh_status(report.synced > 0, error).await;
        result.map(|()| report)
    }

    async fn run_passes(
        &self,
        token: &CancellationToken,
        report: &mut DrainReport,
        in_flight: &mut Option<ActionId>,
    ) -> Result<()> {
        for _ in 0..self.config.max_passes {
            report.passes += 1;
            let now = Utc::now();
            let mut blocked: HashSet<ResourceKey> = HashSet::new();
            let mut progressed = false;

            for action in self.queue.list_outstanding().await? {
                if blocked.contains(&action.resource) {
                    continue;
                }
                // FIFO per resource: a waiting or failed action holds back
                // everything queued after it for the same record.
                if !action.is_ready(now) {
                    blocked.insert(action.resource.clone());
                    continue;
                }
                if token.is_cancelled() {
                    report.cancelled = true;
                    return Ok(());
                }
                if !self.lease.renew().await? {
                    warn!("Drain lease lost, stopping");
                    report.cancelled = true;
                    return Ok(());
                }

                let resource = action.resource.clone();
                *in_flight = Some(action.id.clone());
                let outcome = self.process(action, token).await?;
                progressed = true;
                if outcome != Outcome::Cancelled {
                    *in_flight = None;
                }
                match outcome {
                    Outcome::Synced => report.synced += 1,
                    Outcome::Failed => {
                        report.failed += 1;
                        blocked.insert(resource);
                    }
                    Outcome::Conflict => {
                        report.conflicts += 1;
                        blocked.insert(resource);
                    }
                    Outcome::Cancelled => {
                        report.cancelled = true;
                        return Ok(());
                    }
                }
            }

            if !progressed {
                break;
            }
        }
        Ok(())
    }

    async fn process(&self, action: OfflineAction, token: &CancellationToken) -> Result<Outcome> {
        let action = self.queue.mark_syncing(&action.id).await?;

        if let Some(open) = self.conflicts.find_open(&action.resource).await? {
            let divergence = Divergence {
                server_fields: open.server_data,
                server_last_modified: open.server_last_modified,
                client_fields: action.payload.to_fields()?,
                base: open.base_data,
            };
            self.conflicts.open_or_merge(&action, divergence).await?;
            return Ok(Outcome::Conflict);
        }

        let record = self.records.get(&action.resource).await?;
        let base_version = action
            .version_token
            .or(record.as_ref().and_then(|r| r.last_modified));
        let request = SubmitRequest::for_action(&action, base_version);
        debug!(
            "Submitting {} {} for {} (base {:?})",
            action.kind, action.id, action.resource, base_version
        );

        let result = tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled(format!("submission of {}", action.id))),
            submitted = tokio::time::timeout(self.config.submit_timeout, self.authority.submit(&request)) => {
                match submitted {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!(
                        "submission of {} after {:?}",
                        action.id, self.config.submit_timeout
                    ))),
                }
            }
        };

        match result {
            Ok(SubmitOutcome::Accepted {
                last_modified,
                fields,
            }) => {
                self.commit(&action, last_modified, fields).await?;
                info!("Action {} synced ({})", action.id, action.resource);
                Ok(Outcome::Synced)
            }
            Ok(SubmitOutcome::VersionMismatch {
                server_fields,
                server_last_modified,
            }) => {
                let client_fields = action.payload.to_fields()?;
                if !action.payload.is_delete()
                    && differing_fields(&server_fields, &client_fields).is_empty()
                {
                    // The write landed before, e.g. a replay after a crash.
                    debug!("Authority already holds {}, treating as accepted", action.id);
                    self.commit(&action, server_last_modified, server_fields)
                        .await?;
                    return Ok(Outcome::Synced);
                }
                let divergence = Divergence {
                    server_fields,
                    server_last_modified,
                    client_fields,
                    base: record.and_then(|r| r.server_fields),
                };
                let conflict = self.conflicts.open_or_merge(&action, divergence).await?;
                warn!(
                    "Action {} conflicts with the authority (conflict {})",
                    action.id, conflict.id
                );
                Ok(Outcome::Conflict)
            }
            Err(Error::Cancelled(reason)) => {
                debug!("Cancelled: {}", reason);
                Ok(Outcome::Cancelled)
            }
            Err(e) if e.is_transient() => {
                let updated = self.queue.mark_failed(&action.id, &e).await?;
                warn!(
                    "Action {} failed (attempt {}): {}",
                    action.id, updated.retry_count, e
                );
                Ok(Outcome::Failed)
            }
            Err(e) => {
                self.queue.mark_rejected(&action.id, &e).await?;
                warn!("Action {} rejected: {}", action.id, e);
                Ok(Outcome::Failed)
            }
        }
    }

    async fn commit(
        &self,
        action: &OfflineAction,
        last_modified: DateTime<Utc>,
        fields: Map<String, Value>,
    ) -> Result<()> {
        let extra = match &action.payload {
            ActionPayload::ResolvedRecord { conflict_id, .. } => {
                self.stage_superseded(WriteBatch::new(), conflict_id).await?
            }
            _ => WriteBatch::new(),
        };
        self.queue
            .commit_synced(&action.id, last_modified, fields, extra)
            .await?;
        self.invalidate(&action.resource).await;
        Ok(())
    }

    async fn invalidate(&self, resource: &ResourceKey) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate_resource(resource).await {
                warn!("Could not invalidate cache for {}: {}", resource, e);
            }
        }
    }

    /// Actions settled by a conflict's resolution, following earlier
    /// resolutions that themselves ended up in conflict.
    async fn superseded_by(&self, conflict_id: &ConflictId) -> Result<Vec<OfflineAction>> {
        let mut seen = HashSet::new();
        let mut frontier = VecDeque::from([conflict_id.clone()]);
        let mut actions = Vec::new();

        while let Some(id) = frontier.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            for action in self.queue.list_for_conflict(&id).await? {
                if let ActionPayload::ResolvedRecord { conflict_id, .. } = &action.payload {
                    frontier.push_back(conflict_id.clone());
                }
                actions.push(action);
            }
        }
        Ok(actions)
    }

    async fn stage_superseded(
        &self,
        mut batch: WriteBatch,
        conflict_id: &ConflictId,
    ) -> Result<WriteBatch> {
        let now = Utc::now();
        for previous in self.superseded_by(conflict_id).await? {
            let mut settled = previous.clone();
            settled.mark_synced(now);
            batch = ActionQueue::stage(batch, &previous, &settled)?;
        }
        Ok(batch)
    }

    /// Resolve a conflict.
    ///
    /// Strategies that change the authority's version requeue the result as
    /// a new action carrying the authority's current version token; the
    /// conflict closes in the same write. `server_wins` adopts the
    /// authority's record locally and requeues nothing. Resolving an already
    /// resolved conflict with the same strategy returns it unchanged.
    ///
    /// # Errors
    /// - `Error::NotFound` for unknown conflicts
    /// - `Error::InvalidInput` for a different strategy on a resolved conflict
    ///   or manual resolution without data
    /// - `Error::Validation` if the resolved record breaks domain rules
    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        strategy: ResolutionStrategy,
        data: Option<Map<String, Value>>,
        notes: Option<String>,
    ) -> Result<Conflict> {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let raw = self
                .conflicts
                .get_raw(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("conflict {}", id)))?;
            let conflict: Conflict = decode(raw.clone())?;

            if !conflict.is_open() {
                return if conflict.strategy == Some(strategy) {
                    debug!("Conflict {} already resolved with {}", id, strategy);
                    Ok(conflict)
                } else {
                    Err(Error::InvalidInput(format!(
                        "conflict {} is already resolved with {}",
                        id,
                        conflict
                            .strategy
                            .map_or_else(|| "unknown".to_string(), |s| s.to_string())
                    )))
                };
            }

            let resolution =
                ConflictResolver::resolve(&conflict, strategy, data.clone(), notes.clone())?;
            let now = Utc::now();

            let applied = if resolution.requeue {
                let payload = ActionPayload::ResolvedRecord {
                    resource: conflict.resource.clone(),
                    fields: resolution.data.clone(),
                    conflict_id: conflict.id.clone(),
                };
                let enqueued = self
                    .queue
                    .enqueue_with(payload, Some(conflict.server_last_modified), |action| {
                        let mut closed = conflict.clone();
                        closed.close(&resolution, Some(action.id.clone()), now);
                        ConflictStore::stage_close(WriteBatch::new(), raw.clone(), &closed)
                    })
                    .await;
                match enqueued {
                    Ok(_) => true,
                    Err(Error::Conflict(_)) => false,
                    Err(e) => return Err(e),
                }
            } else {
                let mut closed = conflict.clone();
                closed.close(&resolution, None, now);
                let batch = ConflictStore::stage_close(WriteBatch::new(), raw, &closed)?;
                let batch = self.stage_superseded(batch, &conflict.id).await?;
                let batch = self
                    .stage_server_record(batch, &conflict, &resolution.data)
                    .await?;
                self.store.apply(batch).await?
            };

            if applied {
                info!("Conflict {} resolved with {}", id, strategy);
                self.invalidate(&conflict.resource).await;
                self.refresh_status(false, None).await;
                return self
                    .conflicts
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("conflict {}", id)));
            }
            debug!("Resolution of {} raced another writer, retrying", id);
        }

        Err(Error::Conflict(format!("could not resolve conflict {}", id)))
    }

    /// Adopt the authority's version of a record.
    async fn stage_server_record(
        &self,
        batch: WriteBatch,
        conflict: &Conflict,
        fields: &Map<String, Value>,
    ) -> Result<WriteBatch> {
        let raw = self.records.get_raw(&conflict.resource).await?;
        let mut record = match &raw {
            Some(value) => decode::<DomainRecord>(value.clone())?,
            None => DomainRecord::local(conflict.resource.clone(), Utc::now()),
        };
        let settled = !self
            .queue
            .list_outstanding()
            .await?
            .iter()
            .any(|a| a.resource == conflict.resource);
        record.deleted = false;
        record.accept(conflict.server_last_modified, fields.clone(), settled);

        Ok(batch
            .expect(Table::DomainRecords, conflict.resource.storage_key(), raw)
            .put(
                Table::DomainRecords,
                conflict.resource.storage_key(),
                encode(&record)?,
            ))
    }

    /// Pull the authority's current version of a record into the local
    /// store. Records with unsettled local changes are left alone.
    pub async fn refresh_record(&self, resource: &ResourceKey) -> Result<Option<DomainRecord>> {
        let unsettled = self
            .queue
            .list_all()
            .await?
            .iter()
            .any(|a| &a.resource == resource && a.status != ActionStatus::Synced);
        if unsettled {
            debug!("{} has unsettled local changes, not refreshing", resource);
            return self.records.get(resource).await;
        }

        match self.authority.fetch_record(resource).await? {
            Some(remote) => {
                let record = DomainRecord::from_server(
                    resource.clone(),
                    remote.fields,
                    remote.last_modified,
                    Utc::now(),
                );
                self.records.put(&record).await?;
                Ok(Some(record))
            }
            None => {
                self.store
                    .delete(Table::DomainRecords, &resource.storage_key())
                    .await?;
                Ok(None)
            }
        }
    }

    /// Recompute counters and publish them.
    pub async fn refresh_status(&self, synced_now: bool, error: Option<String>) {
        let counts = async {
            let actions = self.queue.list_all().await?;
            let pending = actions
                .iter()
                .filter(|a| matches!(a.status, ActionStatus::Pending | ActionStatus::Syncing))
                .count();
            let failed = actions
                .iter()
                .filter(|a| a.status == ActionStatus::Failed)
                .count();
            let open = self.conflicts.list_open().await?.len();
            Ok::<_, Error>((pending, failed, open))
        }
        .await;

        let online = self.monitor.is_online();
        let draining = self.is_draining();
        self.status.update(|s| {
            s.is_online = online;
            if synced_now {
                s.last_synced_at = Some(Utc::now());
            }
            match counts {
                Ok((pending, failed, open)) => {
                    s.pending_count = pending;
                    s.failed_count = failed;
                    s.open_conflicts = open;
                    s.last_error = error.clone();
                }
                Err(e) => s.last_error = Some(e.to_string()),
            }
            s.phase = if s.last_error.is_some() || !self.store.is_available() {
                SyncPhase::Error
            } else if draining {
                SyncPhase::Syncing
            } else if !online {
                SyncPhase::Offline
            } else {
                SyncPhase::Idle
            };
        });
    }
}
