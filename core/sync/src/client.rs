//! Offline-capable client: the surface display layers consume.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use scoresync_common::{ActionId, ClientConfig, ConflictId, DeviceId, ResourceKey, Result};
use scoresync_store::{open_store, DurableStore};

use crate::action::{ActionPayload, OfflineAction};
use crate::authority::RemoteAuthority;
use crate::cache::{require, CacheResponse, CacheStatus, PrimeReport, ResourceCache, ResourceFetcher};
use crate::conflict::{Conflict, ResolutionStrategy};
use crate::connectivity::{ConnectivityMonitor, ReachabilityProbe};
use crate::device::DeviceIdentity;
use crate::messaging::{CacheWorker, ControlClient};
use crate::orchestrator::{DrainReport, SyncOrchestrator};
use crate::queue::ActionQueue;
use crate::record::DomainRecord;
use crate::rules::{PayloadValidator, ScoreRules};
use crate::scheduler::{SyncScheduler, SyncTrigger};
use crate::status::{StatusPublisher, SyncStatusSnapshot};

/// Records removed by [`OfflineClient::prune`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub actions: usize,
    pub conflicts: usize,
}

/// Builder for [`OfflineClient`].
pub struct OfflineClientBuilder {
    config: ClientConfig,
    authority: Arc<dyn RemoteAuthority>,
    fetcher: Arc<dyn ResourceFetcher>,
    store: Option<Arc<dyn DurableStore>>,
    validators: Vec<Arc<dyn PayloadValidator>>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    initially_online: bool,
}

impl OfflineClientBuilder {
    pub fn new(
        config: ClientConfig,
        authority: Arc<dyn RemoteAuthority>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Self {
        Self {
            config,
            authority,
            fetcher,
            store: None,
            validators: vec![Arc::new(ScoreRules::reference())],
            probe: None,
            initially_online: true,
        }
    }

    /// Use this store instead of opening `config.store_path`.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the domain validators.
    pub fn validators(mut self, validators: Vec<Arc<dyn PayloadValidator>>) -> Self {
        self.validators = validators;
        self
    }

    /// Poll a reachability probe every `connectivity.probe_interval`.
    pub fn probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Platform reachability at startup.
    pub fn initially_online(mut self, online: bool) -> Self {
        self.initially_online = online;
        self
    }

    /// Open the client.
    ///
    /// # Postconditions
    /// - Actions left `syncing` by a previous run are back to `pending`
    /// - The scheduler and the cache worker are running
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Store failures while recovering; an unavailable store is not an
    ///   error, the client runs degraded
    pub async fn open(self) -> Result<OfflineClient> {
        self.config.validate()?;
        let config = self.config;
        let store = match self.store {
            Some(store) => store,
            None => open_store(config.store_path.as_deref()),
        };

        let device_id = if store.is_available() {
            DeviceIdentity::load_or_create(store.as_ref()).await?
        } else {
            warn!("Durable store unavailable, running without offline capability");
            DeviceId::generate()
        };

        let mut queue = ActionQueue::new(store.clone(), device_id.clone(), config.retry.clone());
        for validator in self.validators {
            queue = queue.with_validator(validator);
        }
        let queue = Arc::new(queue);

        let cache = Arc::new(ResourceCache::new(
            store.clone(),
            self.fetcher,
            &config.cache,
            config.retry.clone(),
        ));

        let monitor = Arc::new(ConnectivityMonitor::start(
            self.initially_online,
            config.connectivity.debounce,
        ));
        if let Some(probe) = self.probe {
            monitor.spawn_probe(probe, config.connectivity.probe_interval);
        }

        let status = Arc::new(StatusPublisher::default());
        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                store.clone(),
                queue,
                self.authority,
                monitor.clone(),
                status.clone(),
                config.sync.clone(),
            )
            .with_cache(cache.clone()),
        );

        if store.is_available() {
            orchestrator.recover_stuck().await?;
        }

        let (scheduler, handle) = SyncScheduler::new(config.sync.periodic_interval);
        let (worker, control) = CacheWorker::new(cache.clone(), config.sync.submit_timeout);
        let tasks = vec![
            tokio::spawn(handle.run(orchestrator.clone(), monitor.subscribe())),
            tokio::spawn(worker.run()),
        ];

        orchestrator.refresh_status(false, None).await;
        info!("Offline client open (device {}, store {})", device_id, store.name());

        Ok(OfflineClient {
            config,
            store,
            cache,
            monitor,
            status,
            orchestrator,
            scheduler,
            control,
            tasks: Mutex::new(tasks),
        })
    }
}

/// Offline-first client.
pub struct OfflineClient {
    config: ClientConfig,
    store: Arc<dyn DurableStore>,
    cache: Arc<ResourceCache>,
    monitor: Arc<ConnectivityMonitor>,
    status: Arc<StatusPublisher>,
    orchestrator: Arc<SyncOrchestrator>,
    scheduler: SyncScheduler,
    control: ControlClient,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineClient {
    /// Open a client with the default validators.
    pub async fn open(
        config: ClientConfig,
        authority: Arc<dyn RemoteAuthority>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Result<Self> {
        OfflineClientBuilder::new(config, authority, fetcher)
            .open()
            .await
    }

    pub fn builder(
        config: ClientConfig,
        authority: Arc<dyn RemoteAuthority>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> OfflineClientBuilder {
        OfflineClientBuilder::new(config, authority, fetcher)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn device_id(&self) -> &DeviceId {
        self.orchestrator.queue().device_id()
    }

    /// Whether offline capability is active.
    pub fn is_durable(&self) -> bool {
        self.store.is_available()
    }

    /// Queue a mutation for the authority.
    ///
    /// The local record reflects the change immediately. A drain is
    /// requested when online.
    ///
    /// # Errors
    /// - `Error::Validation` for malformed or rule-breaking payloads
    /// - `Error::Storage` if the store is unavailable
    pub async fn enqueue(&self, payload: ActionPayload) -> Result<OfflineAction> {
        let action = self.orchestrator.queue().enqueue(payload).await?;
        self.after_write().await;
        Ok(action)
    }

    /// Manual retry of a failed action.
    pub async fn retry_action(&self, id: &ActionId) -> Result<OfflineAction> {
        let action = self.orchestrator.queue().requeue_failed(id).await?;
        self.after_write().await;
        Ok(action)
    }

    /// Actions not yet settled, oldest first.
    pub async fn outstanding(&self) -> Result<Vec<OfflineAction>> {
        self.orchestrator.queue().list_outstanding().await
    }

    pub async fn actions(&self) -> Result<Vec<OfflineAction>> {
        self.orchestrator.queue().list_all().await
    }

    async fn after_write(&self) {
        self.orchestrator.refresh_status(false, None).await;
        if self.monitor.is_online() {
            self.scheduler.notify(SyncTrigger::Enqueued);
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatusSnapshot {
        self.status.current()
    }

    pub async fn list_open_conflicts(&self) -> Result<Vec<Conflict>> {
        self.orchestrator.conflicts().list_open().await
    }

    pub async fn conflict(&self, id: &ConflictId) -> Result<Option<Conflict>> {
        self.orchestrator.conflicts().get(id).await
    }

    /// Resolve a conflict. See [`SyncOrchestrator::resolve_conflict`].
    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        strategy: ResolutionStrategy,
        data: Option<Map<String, Value>>,
        notes: Option<String>,
    ) -> Result<Conflict> {
        let conflict = self
            .orchestrator
            .resolve_conflict(id, strategy, data, notes)
            .await?;
        if conflict.resolution_action.is_some() && self.monitor.is_online() {
            self.scheduler.notify(SyncTrigger::Enqueued);
        }
        Ok(conflict)
    }

    /// Read a resource through the cache.
    pub async fn read(&self, path: &str) -> CacheResponse {
        self.cache.read(path).await
    }

    /// Read and deserialize a JSON resource. Unavailable resources are errors.
    pub async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        require(self.cache.read(path).await)?.json()
    }

    pub async fn prime_cache(&self, paths: &[String]) -> PrimeReport {
        self.cache.prime_cache(paths).await
    }

    pub async fn clear_cache(&self) -> Result<usize> {
        self.cache.clear_cache().await
    }

    pub async fn cache_status(&self) -> Result<CacheStatus> {
        self.cache.cache_status().await
    }

    /// Client for the cache worker's control channel.
    pub fn control(&self) -> ControlClient {
        self.control.clone()
    }

    /// Drain now and wait for the report.
    pub async fn sync_now(&self) -> Result<DrainReport> {
        self.scheduler.request_sync().await
    }

    pub fn cancel_sync(&self) {
        self.orchestrator.cancel_sync();
    }

    /// Feed a platform reachability reading.
    pub async fn set_online(&self, online: bool) {
        self.monitor.set_online(online);
        self.orchestrator.refresh_status(false, None).await;
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub async fn record(&self, resource: &ResourceKey) -> Result<Option<DomainRecord>> {
        self.orchestrator.records().get(resource).await
    }

    pub async fn records(&self, resource_type: &str) -> Result<Vec<DomainRecord>> {
        self.orchestrator.records().list(resource_type).await
    }

    /// Pull the authority's version of a record without local changes.
    pub async fn refresh_record(&self, resource: &ResourceKey) -> Result<Option<DomainRecord>> {
        self.orchestrator.refresh_record(resource).await
    }

    /// Delete synced actions and resolved conflicts past their retention.
    pub async fn prune(&self) -> Result<PruneReport> {
        let retention = &self.config.retention;
        Ok(PruneReport {
            actions: self
                .orchestrator
                .queue()
                .prune_synced(retention.synced_actions)
                .await?,
            conflicts: self
                .orchestrator
                .conflicts()
                .prune_resolved(retention.resolved_conflicts)
                .await?,
        })
    }

    /// Stop background work. In-flight submissions are cancelled and their
    /// actions go back to `pending`.
    pub async fn close(&self) {
        self.scheduler.shutdown().await;
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.monitor.shutdown();
        info!("Offline client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionStatus, ScoreMutation};
    use crate::authority::MemoryAuthority;
    use crate::cache::tests::ScriptedFetcher;
    use crate::orchestrator::SkipReason;
    use crate::status::SyncPhase;
    use scoresync_common::Error;
    use scoresync_store::{MemoryStore, UnavailableStore};
    use std::time::Duration;

    fn score(value: f64, justification: Option<&str>) -> ActionPayload {
        ActionPayload::ScoreUpsert(ScoreMutation {
            score_id: "s-1".to_string(),
            competitor_id: "c-1".to_string(),
            criterion_id: "technique".to_string(),
            judge_id: "j-1".to_string(),
            value,
            justification: justification.map(str::to_string),
        })
    }

    async fn client(
        store: Arc<dyn DurableStore>,
        authority: Arc<MemoryAuthority>,
        online: bool,
    ) -> OfflineClient {
        let fetcher = Arc::new(ScriptedFetcher::default().with("/api/events/e-1", r#"{"id":"e-1"}"#));
        OfflineClient::builder(ClientConfig::default(), authority, fetcher)
            .store(store)
            .initially_online(online)
            .open()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_offline_enqueue_then_sync() {
        let authority = Arc::new(MemoryAuthority::new());
        let client = client(Arc::new(MemoryStore::new()), authority.clone(), false).await;

        let action = client.enqueue(score(5.0, None)).await.unwrap();
        let status = client.status();
        assert_eq!(status.pending_count, 1);
        assert!(!status.is_online);

        let record = client.record(&action.resource).await.unwrap().unwrap();
        assert!(!record.is_synced);
        assert_eq!(record.fields["value"], 5.0);

        assert_eq!(
            client.sync_now().await.unwrap().skipped,
            Some(SkipReason::Offline)
        );

        client.set_online(true).await;
        let report = client.sync_now().await.unwrap();
        // A reconnect-triggered drain may have got there first.
        assert!(report.synced == 1 || report.skipped.is_some());
        let mut rx = client.subscribe_status();
        let status = rx
            .wait_for(|s| s.pending_count == 0 && s.phase == SyncPhase::Idle)
            .await
            .unwrap()
            .clone();
        assert!(status.last_synced_at.is_some());
        assert_eq!(authority.submissions().len(), 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_invalid_mutation_never_enters_queue() {
        let client = client(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryAuthority::new()),
            false,
        )
        .await;

        let err = client.enqueue(score(9.5, None)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(client.actions().await.unwrap().is_empty());

        client
            .enqueue(score(9.5, Some("clean landing")))
            .await
            .unwrap();
        assert_eq!(client.outstanding().await.unwrap().len(), 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_recovers_syncing_actions_on_open() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let authority = Arc::new(MemoryAuthority::new());
        let first = client(store.clone(), authority.clone(), false).await;
        let action = first.enqueue(score(5.0, None)).await.unwrap();
        first
            .orchestrator
            .queue()
            .mark_syncing(&action.id)
            .await
            .unwrap();
        first.close().await;

        let second = client(store, authority, false).await;
        let recovered = second.actions().await.unwrap();
        assert_eq!(recovered[0].status, ActionStatus::Pending);
        assert_eq!(second.device_id(), first.device_id());
        second.close().await;
    }

    #[tokio::test]
    async fn test_degraded_store_keeps_reads_working() {
        let client = client(
            Arc::new(UnavailableStore::new("private mode")),
            Arc::new(MemoryAuthority::new()),
            true,
        )
        .await;
        assert!(!client.is_durable());

        let err = client.enqueue(score(5.0, None)).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let event: Value = client.read_json("/api/events/e-1").await.unwrap();
        assert_eq!(event["id"], "e-1");
        assert_eq!(client.status().phase, SyncPhase::Error);
        client.close().await;
    }

    #[tokio::test]
    async fn test_unavailable_read_is_explicit() {
        let client = client(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryAuthority::new()),
            false,
        )
        .await;
        let response = client.read("/api/events/e-404").await;
        assert!(!response.is_served());
        assert!(client.read_json::<Value>("/api/events/e-404").await.is_err());
        client.close().await;
    }

    #[tokio::test]
    async fn test_control_channel_and_prune() {
        let client = client(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryAuthority::new()),
            true,
        )
        .await;
        let control = client.control();
        let report = control.prime(vec!["/api/events/e-1".to_string()]).await.unwrap();
        assert_eq!(report.primed, vec!["/api/events/e-1".to_string()]);
        assert_eq!(client.cache_status().await.unwrap().entries, 1);

        assert_eq!(client.prune().await.unwrap(), PruneReport::default());
        client.close().await;
        assert!(tokio::time::timeout(Duration::from_secs(1), control.clear())
            .await
            .map_or(true, |r| r.is_err()));
    }
}
