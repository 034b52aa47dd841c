//! Resource cache with per-path caching strategies.
//!
//! Reads of remote resources are classified by path prefix into
//! cache-first, network-first or stale-while-revalidate. Only side-effect
//! free reads pass through here; mutations go through the action queue.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scoresync_common::{CacheConfig, Error, ResourceKey, Result, RetryConfig};
use scoresync_store::{decode, encode, DurableStore, IndexFilter, Table};

use crate::retry::RetryExecutor;

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Caching strategy for a class of resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Immutable assets: serve any cached copy.
    CacheFirst,
    /// Critical or uncacheable data: always ask the network.
    NetworkFirst,
    /// Cacheable API reads: serve fresh copies at once, refresh behind.
    StaleWhileRevalidate,
}

/// Static classification of paths by prefix. The longest prefix wins;
/// unclassified paths are network-first.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    rules: Vec<(String, CachePolicy)>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Static assets cache-first, competition data stale-while-revalidate.
    pub fn reference() -> Self {
        let mut table = Self::new();
        for prefix in ["/static/", "/assets/", "/icons/", "/fonts/"] {
            table = table.with_rule(prefix, CachePolicy::CacheFirst);
        }
        for prefix in [
            "/api/competitions",
            "/api/events",
            "/api/competitors",
            "/api/criteria",
            "/api/scores",
            "/api/evaluations",
        ] {
            table = table.with_rule(prefix, CachePolicy::StaleWhileRevalidate);
        }
        table
    }

    /// Reference table extended with configured prefixes.
    pub fn from_config(config: &CacheConfig) -> Self {
        let mut table = Self::reference();
        for prefix in &config.cache_first_prefixes {
            table = table.with_rule(prefix.clone(), CachePolicy::CacheFirst);
        }
        for prefix in &config.revalidate_prefixes {
            table = table.with_rule(prefix.clone(), CachePolicy::StaleWhileRevalidate);
        }
        table
    }

    pub fn with_rule(mut self, prefix: impl Into<String>, policy: CachePolicy) -> Self {
        self.rules.push((prefix.into(), policy));
        self
    }

    pub fn classify(&self, path: &str) -> CachePolicy {
        self.rules
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(CachePolicy::NetworkFirst, |(_, policy)| *policy)
    }
}

/// A successful network response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedResource {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl FetchedResource {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Transport used by the cache to reach the network.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// GET a path.
    ///
    /// # Errors
    /// Any non-success response or transport failure.
    async fn fetch(&self, path: &str) -> Result<FetchedResource>;
}

/// A cached response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub cached_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, resource: &FetchedResource, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            body: resource.body.clone(),
            headers: resource.headers.clone(),
            cached_at: now,
            ttl_secs: ttl.as_secs(),
        }
    }

    /// Older than its TTL. Stale entries remain usable as a fallback.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        now.signed_duration_since(self.cached_at) > ChronoDuration::seconds(ttl)
    }

    fn into_resource(self) -> FetchedResource {
        FetchedResource {
            status: 200,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Network,
    Cache,
    /// Past its TTL, served because the network failed.
    StaleCache,
}

/// Result of a read through the cache. Reads never fail with an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheResponse {
    Served {
        resource: FetchedResource,
        source: CacheSource,
    },
    /// Not cached and not reachable.
    Unavailable { path: String, reason: String },
    /// Network-first read failed; no cached data is substituted.
    OfflineError { path: String, message: String },
}

impl CacheResponse {
    pub fn is_served(&self) -> bool {
        matches!(self, CacheResponse::Served { .. })
    }

    pub fn source(&self) -> Option<CacheSource> {
        match self {
            CacheResponse::Served { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn resource(&self) -> Option<&FetchedResource> {
        match self {
            CacheResponse::Served { resource, .. } => Some(resource),
            _ => None,
        }
    }
}

/// Summary of the cache contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub entries: usize,
    pub total_size: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Outcome of [`ResourceCache::prime_cache`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimeReport {
    pub primed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Fetch a path and store the response. A failed cache write is logged and
/// the network response is still returned.
async fn fetch_and_store(
    store: &dyn DurableStore,
    fetcher: &dyn ResourceFetcher,
    path: &str,
    ttl: Duration,
) -> Result<FetchedResource> {
    let resource = fetcher.fetch(path).await?;
    let entry = CacheEntry::new(path, &resource, ttl, Utc::now());
    match encode(&entry) {
        Ok(value) => {
            if let Err(e) = store.put(Table::CacheEntries, path, value).await {
                warn!("Could not cache {}: {}", path, e);
            }
        }
        Err(e) => warn!("Could not encode cache entry for {}: {}", path, e),
    }
    Ok(resource)
}

/// Read-through cache over the durable store.
pub struct ResourceCache {
    store: Arc<dyn DurableStore>,
    fetcher: Arc<dyn ResourceFetcher>,
    policies: PolicyTable,
    ttl: Duration,
    retry: RetryConfig,
    /// In-flight background refreshes, by path.
    revalidations: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ResourceCache {
    pub fn new(
        store: Arc<dyn DurableStore>,
        fetcher: Arc<dyn ResourceFetcher>,
        config: &CacheConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            policies: PolicyTable::from_config(config),
            ttl: config.ttl,
            retry,
            revalidations: Mutex::new(Vec::new()),
        }
    }

    /// Replace the classification table.
    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    pub fn policy_for(&self, path: &str) -> CachePolicy {
        self.policies.classify(path)
    }

    /// Intercept a request. Only `GET` and `HEAD` are handled; anything else
    /// returns `None` and must go through the action queue.
    pub async fn intercept(&self, method: &str, path: &str) -> Option<CacheResponse> {
        if method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD") {
            Some(self.read(path).await)
        } else {
            None
        }
    }

    /// Read a resource using its path's policy.
    pub async fn read(&self, path: &str) -> CacheResponse {
        match self.policy_for(path) {
            CachePolicy::CacheFirst => self.cache_first(path).await,
            CachePolicy::NetworkFirst => self.network_first(path).await,
            CachePolicy::StaleWhileRevalidate => self.stale_while_revalidate(path).await,
        }
    }

    async fn cache_first(&self, path: &str) -> CacheResponse {
        if let Some(entry) = self.lookup(path).await {
            debug!("Cache hit for {}", path);
            return CacheResponse::Served {
                resource: entry.into_resource(),
                source: CacheSource::Cache,
            };
        }
        match fetch_and_store(self.store.as_ref(), self.fetcher.as_ref(), path, self.ttl).await {
            Ok(resource) => CacheResponse::Served {
                resource,
                source: CacheSource::Network,
            },
            Err(e) => CacheResponse::Unavailable {
                path: path.to_string(),
                reason: e.to_string(),
            },
        }
    }

    async fn network_first(&self, path: &str) -> CacheResponse {
        match self.fetcher.fetch(path).await {
            Ok(resource) => CacheResponse::Served {
                resource,
                source: CacheSource::Network,
            },
            Err(e) => {
                debug!("Network-first read of {} failed: {}", path, e);
                CacheResponse::OfflineError {
                    path: path.to_string(),
                    message: e.to_string(),
                }
            }
        }
    }

    async fn stale_while_revalidate(&self, path: &str) -> CacheResponse {
        let cached = self.lookup(path).await;

        if let Some(entry) = &cached {
            if !entry.is_stale(Utc::now()) {
                debug!("Fresh cache hit for {}, revalidating", path);
                self.spawn_revalidation(path);
                return CacheResponse::Served {
                    resource: entry.clone().into_resource(),
                    source: CacheSource::Cache,
                };
            }
        }

        match fetch_and_store(self.store.as_ref(), self.fetcher.as_ref(), path, self.ttl).await {
            Ok(resource) => CacheResponse::Served {
                resource,
                source: CacheSource::Network,
            },
            Err(e) => match cached {
                Some(entry) => {
                    warn!("Serving stale {} after network failure: {}", path, e);
                    CacheResponse::Served {
                        resource: entry.into_resource(),
                        source: CacheSource::StaleCache,
                    }
                }
                None => CacheResponse::Unavailable {
                    path: path.to_string(),
                    reason: e.to_string(),
                },
            },
        }
    }

    fn spawn_revalidation(&self, path: &str) {
        let store = self.store.clone();
        let fetcher = self.fetcher.clone();
        let key = path.to_string();
        let path = key.clone();
        let ttl = self.ttl;
        let handle = tokio::spawn(async move {
            if let Err(e) = fetch_and_store(store.as_ref(), fetcher.as_ref(), &path, ttl).await {
                debug!("Background revalidation of {} failed: {}", path, e);
            }
        });

        let mut pending = self
            .revalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        pending.retain(|(_, h)| !h.is_finished());
        pending.push((key, handle));
    }

    /// Wait for every background revalidation started so far.
    pub async fn settle(&self) {
        let pending: Vec<_> = self
            .revalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .map(|(_, handle)| handle)
            .collect();
        futures::future::join_all(pending).await;
    }

    async fn lookup(&self, path: &str) -> Option<CacheEntry> {
        match self.store.get(Table::CacheEntries, path).await {
            Ok(Some(value)) => match decode::<CacheEntry>(value) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Dropping unreadable cache entry {}: {}", path, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!("Cache lookup for {} failed: {}", path, e);
                None
            }
        }
    }

    /// Drop cached copies of a record and of its collection listings.
    pub async fn invalidate_resource(&self, resource: &ResourceKey) -> Result<usize> {
        let record_path = resource.api_path();
        let collection = resource.collection_path();

        // A refresh started before the write would put the old body back.
        self.revalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(path, handle)| {
                let affected = is_same_path(path, &collection) || is_same_path(path, &record_path);
                if affected {
                    debug!("Aborting revalidation of {}", path);
                    handle.abort();
                }
                !affected
            });

        let rows = self
            .store
            .get_all(Table::CacheEntries, Some(IndexFilter::KeyPrefix(collection.clone())))
            .await?;

        let mut removed = 0;
        for row in rows {
            let key = row.key.as_str();
            if is_same_path(key, &collection) || is_same_path(key, &record_path) {
                self.store.delete(Table::CacheEntries, key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Invalidated {} cache entries for {}", removed, resource);
        }
        Ok(removed)
    }

    /// Fetch and store paths ahead of going offline.
    pub async fn prime_cache(&self, paths: &[String]) -> PrimeReport {
        let executor = RetryExecutor::new(self.retry.clone());
        let mut report = PrimeReport::default();

        let fetches = paths.iter().map(|path| {
            let executor = &executor;
            async move {
                let result = executor
                    .execute(|| {
                        fetch_and_store(self.store.as_ref(), self.fetcher.as_ref(), path, self.ttl)
                    })
                    .await;
                (path, result)
            }
        });

        for (path, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(_) => report.primed.push(path.clone()),
                Err(e) => report.failed.push((path.clone(), e.to_string())),
            }
        }

        info!(
            "Primed {} resources ({} failed)",
            report.primed.len(),
            report.failed.len()
        );
        report
    }

    /// Remove every cached entry.
    pub async fn clear_cache(&self) -> Result<usize> {
        for (_, handle) in self
            .revalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
        let cleared = self.store.clear(Table::CacheEntries).await?;
        info!("Cleared {} cache entries", cleared);
        Ok(cleared)
    }

    pub async fn cache_status(&self) -> Result<CacheStatus> {
        let mut status = CacheStatus::default();
        for row in self.store.get_all(Table::CacheEntries, None).await? {
            let entry: CacheEntry = match decode(row.value) {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            status.entries += 1;
            status.total_size += entry.body.len() as u64;
            status.last_updated = status.last_updated.max(Some(entry.cached_at));
        }
        Ok(status)
    }
}

impl Drop for ResourceCache {
    fn drop(&mut self) {
        let pending = self
            .revalidations
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in pending.drain(..) {
            handle.abort();
        }
    }
}

/// `key` is `path`, optionally followed by a query string.
fn is_same_path(key: &str, path: &str) -> bool {
    key.strip_prefix(path)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('?'))
}

/// Convert a cache-layer failure of a required read into an error.
pub fn require(response: CacheResponse) -> Result<FetchedResource> {
    match response {
        CacheResponse::Served { resource, .. } => Ok(resource),
        CacheResponse::Unavailable { path, reason } => {
            Err(Error::NotFound(format!("{} is unavailable offline: {}", path, reason)))
        }
        CacheResponse::OfflineError { path, message } => {
            Err(Error::Network(format!("{}: {}", path, message)))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use scoresync_store::MemoryStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fetcher serving canned bodies; can be switched offline.
    #[derive(Default)]
    pub(crate) struct ScriptedFetcher {
        bodies: Mutex<HashMap<String, String>>,
        offline: AtomicBool,
        delay: Mutex<Option<Duration>>,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        pub(crate) fn with(self, path: &str, body: &str) -> Self {
            self.set(path, body);
            self
        }

        pub(crate) fn set(&self, path: &str, body: &str) {
            self.bodies
                .lock()
                .unwrap()
                .insert(path.to_string(), body.to_string());
        }

        pub(crate) fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        /// Hold each response for `delay` after reading the body.
        pub(crate) fn set_delay(&self, delay: Option<Duration>) {
            *self.delay.lock().unwrap() = delay;
        }
    }

    #[async_trait]
    impl ResourceFetcher for ScriptedFetcher {
        async fn fetch(&self, path: &str) -> Result<FetchedResource> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(Error::Network("offline".to_string()));
            }
            let body = self
                .bodies
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| Error::NotFound(path.to_string()))?;
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(FetchedResource {
                status: 200,
                headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
                body: body.into_bytes(),
            })
        }
    }

    fn cache_with(fetcher: Arc<ScriptedFetcher>) -> (ResourceCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let retry = RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let cache = ResourceCache::new(store.clone(), fetcher, &CacheConfig::default(), retry);
        (cache, store)
    }

    fn body(response: &CacheResponse) -> String {
        String::from_utf8(response.resource().unwrap().body.clone()).unwrap()
    }

    #[test]
    fn test_classification() {
        let table = PolicyTable::reference();
        assert_eq!(table.classify("/static/app.js"), CachePolicy::CacheFirst);
        assert_eq!(table.classify("/api/events/e-1"), CachePolicy::StaleWhileRevalidate);
        assert_eq!(table.classify("/api/auth/session"), CachePolicy::NetworkFirst);

        let table = table.with_rule("/api/events/live", CachePolicy::NetworkFirst);
        assert_eq!(table.classify("/api/events/live/feed"), CachePolicy::NetworkFirst);
    }

    #[test]
    fn test_ttl_boundaries() {
        let cached_at = Utc::now();
        let entry = CacheEntry {
            key: "/api/events".to_string(),
            body: Vec::new(),
            headers: BTreeMap::new(),
            cached_at,
            ttl_secs: 24 * 60 * 60,
        };
        assert!(!entry.is_stale(cached_at + ChronoDuration::hours(23)));
        assert!(entry.is_stale(cached_at + ChronoDuration::hours(25)));
    }

    #[test]
    fn test_entry_body_is_base64_in_store() {
        let entry = CacheEntry {
            key: "/icons/a.png".to_string(),
            body: vec![0, 159, 146, 150],
            headers: BTreeMap::new(),
            cached_at: Utc::now(),
            ttl_secs: 60,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value["body"].is_string());
        let back: CacheEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[tokio::test]
    async fn test_mutations_are_not_intercepted() {
        let (cache, _) = cache_with(Arc::new(ScriptedFetcher::default()));
        assert!(cache.intercept("POST", "/api/scores").await.is_none());
        assert!(cache.intercept("get", "/api/scores").await.is_some());
    }

    #[tokio::test]
    async fn test_cache_first_serves_stored_copy() {
        let fetcher = Arc::new(ScriptedFetcher::default().with("/static/app.css", "body{}"));
        let (cache, _) = cache_with(fetcher.clone());

        let first = cache.read("/static/app.css").await;
        assert_eq!(first.source(), Some(CacheSource::Network));

        fetcher.set_offline(true);
        let second = cache.read("/static/app.css").await;
        assert_eq!(second.source(), Some(CacheSource::Cache));
        assert_eq!(body(&second), "body{}");

        let missing = cache.read("/static/other.css").await;
        assert!(matches!(missing, CacheResponse::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_network_first_never_substitutes_cache() {
        let fetcher = Arc::new(ScriptedFetcher::default().with("/api/auth/me", "{\"id\":1}"));
        let (cache, store) = cache_with(fetcher.clone());

        assert!(cache.read("/api/auth/me").await.is_served());
        assert_eq!(store.count(Table::CacheEntries).await.unwrap(), 0);

        fetcher.set_offline(true);
        assert!(matches!(
            cache.read("/api/auth/me").await,
            CacheResponse::OfflineError { .. }
        ));
    }

    #[tokio::test]
    async fn test_swr_serves_fresh_and_refreshes_behind() {
        let fetcher = Arc::new(ScriptedFetcher::default().with("/api/events", "v1"));
        let (cache, _) = cache_with(fetcher.clone());

        assert_eq!(cache.read("/api/events").await.source(), Some(CacheSource::Network));

        fetcher.set("/api/events", "v2");
        let served = cache.read("/api/events").await;
        assert_eq!(served.source(), Some(CacheSource::Cache));
        assert_eq!(body(&served), "v1");

        cache.settle().await;
        fetcher.set_offline(true);
        assert_eq!(body(&cache.read("/api/events").await), "v2");
    }

    #[tokio::test]
    async fn test_swr_stale_entry_waits_for_network_then_falls_back() {
        let fetcher = Arc::new(ScriptedFetcher::default().with("/api/events", "new"));
        let (cache, store) = cache_with(fetcher.clone());
        let stale = CacheEntry {
            key: "/api/events".to_string(),
            body: b"old".to_vec(),
            headers: BTreeMap::new(),
            cached_at: Utc::now() - ChronoDuration::hours(25),
            ttl_secs: 24 * 60 * 60,
        };
        store
            .put(Table::CacheEntries, "/api/events", encode(&stale).unwrap())
            .await
            .unwrap();

        let served = cache.read("/api/events").await;
        assert_eq!(served.source(), Some(CacheSource::Network));
        assert_eq!(body(&served), "new");

        store
            .put(Table::CacheEntries, "/api/events", encode(&stale).unwrap())
            .await
            .unwrap();
        fetcher.set_offline(true);
        let served = cache.read("/api/events").await;
        assert_eq!(served.source(), Some(CacheSource::StaleCache));
        assert_eq!(body(&served), "old");

        assert!(matches!(
            cache.read("/api/competitors").await,
            CacheResponse::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalidate_record_and_listing() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with("/api/scores", "[]")
                .with("/api/scores/s-1", "{}")
                .with("/api/scores/s-10", "{}")
                .with("/api/events", "[]"),
        );
        let (cache, store) = cache_with(fetcher);
        for path in ["/api/scores", "/api/scores/s-1", "/api/scores/s-10", "/api/events"] {
            cache.read(path).await;
        }
        cache.settle().await;

        let removed = cache
            .invalidate_resource(&ResourceKey::parse("scores/s-1").unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count(Table::CacheEntries).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_aborts_inflight_revalidation() {
        let fetcher = Arc::new(ScriptedFetcher::default().with("/api/scores/s-1", "old"));
        let (cache, store) = cache_with(fetcher.clone());
        cache.read("/api/scores/s-1").await;

        // The refresh reads the pre-sync body, then stalls.
        fetcher.set_delay(Some(Duration::from_secs(5)));
        assert_eq!(
            cache.read("/api/scores/s-1").await.source(),
            Some(CacheSource::Cache)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        cache
            .invalidate_resource(&ResourceKey::parse("scores/s-1").unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        cache.settle().await;

        assert!(store
            .get(Table::CacheEntries, "/api/scores/s-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prime_fetches_paths_concurrently() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with("/api/events", "[]")
                .with("/api/competitors", "[]")
                .with("/api/criteria", "[]"),
        );
        fetcher.set_delay(Some(Duration::from_secs(1)));
        let (cache, _) = cache_with(fetcher);

        let started = tokio::time::Instant::now();
        let paths = ["/api/events", "/api/competitors", "/api/criteria"].map(String::from);
        let report = cache.prime_cache(&paths).await;
        assert_eq!(report.primed, paths.to_vec());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prime_status_and_clear() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with("/api/events", "[1,2]")
                .with("/static/logo.svg", "<svg/>"),
        );
        let (cache, _) = cache_with(fetcher);

        let report = cache
            .prime_cache(&[
                "/api/events".to_string(),
                "/static/logo.svg".to_string(),
                "/api/missing".to_string(),
            ])
            .await;
        assert_eq!(report.primed.len(), 2);
        assert_eq!(report.failed.len(), 1);

        let status = cache.cache_status().await.unwrap();
        assert_eq!(status.entries, 2);
        assert_eq!(status.total_size, 11);
        assert!(status.last_updated.is_some());

        assert_eq!(cache.clear_cache().await.unwrap(), 2);
        assert_eq!(cache.cache_status().await.unwrap(), CacheStatus::default());
    }
}
