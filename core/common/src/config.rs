//! Client configuration.
//!
//! Stored as JSON. Every field has a default, so an empty object `{}` is a
//! valid configuration file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration for retry behavior of transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of submission attempts before an action is reported
    /// as persistently failed.
    pub max_attempts: u32,
    /// Initial delay between retries.
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay for a given (zero-based) attempt, capped at `max_delay`.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Resource cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Hard TTL after which a cached entry is stale.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Extra path prefixes served cache-first (static assets).
    pub cache_first_prefixes: Vec<String>,
    /// Extra path prefixes served stale-while-revalidate (cacheable API reads).
    pub revalidate_prefixes: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            cache_first_prefixes: Vec::new(),
            revalidate_prefixes: Vec::new(),
        }
    }
}

/// Sync orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval of the periodic drain while online.
    #[serde(with = "duration_secs")]
    pub periodic_interval: Duration,
    /// Upper bound for a single submission to the authority.
    #[serde(with = "duration_millis")]
    pub submit_timeout: Duration,
    /// How long a drain lease stays valid without renewal.
    #[serde(with = "duration_secs")]
    pub lease_ttl: Duration,
    /// Maximum passes over the queue within one drain cycle.
    pub max_passes: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            periodic_interval: Duration::from_secs(60),
            submit_timeout: Duration::from_secs(15),
            lease_ttl: Duration::from_secs(60),
            max_passes: 8,
        }
    }
}

/// Connectivity monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Quiet period required before announcing reachability.
    #[serde(with = "duration_millis")]
    pub debounce: Duration,
    /// Interval between reachability probes.
    #[serde(with = "duration_secs")]
    pub probe_interval: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            probe_interval: Duration::from_secs(10),
        }
    }
}

/// How long terminal records are kept before pruning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    #[serde(with = "duration_secs")]
    pub synced_actions: Duration,
    #[serde(with = "duration_secs")]
    pub resolved_conflicts: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            synced_actions: Duration::from_secs(7 * 24 * 60 * 60),
            resolved_conflicts: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// SQLite file backing the durable store. `None` keeps everything in memory.
    pub store_path: Option<PathBuf>,
    /// Base URL of the remote authority.
    pub authority_url: Option<String>,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub connectivity: ConnectivityConfig,
    pub retention: RetentionConfig,
}

impl ClientConfig {
    /// Load a configuration file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - JSON is malformed
    /// - Values fail [`ClientConfig::validate`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values that would stall or spin the sync loop.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(Error::InvalidInput(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.retry.max_delay < self.retry.initial_delay {
            return Err(Error::InvalidInput(
                "retry.max_delay must not be below retry.initial_delay".to_string(),
            ));
        }
        if self.sync.submit_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "sync.submit_timeout must be positive".to_string(),
            ));
        }
        if self.sync.lease_ttl.is_zero() || self.sync.periodic_interval.is_zero() {
            return Err(Error::InvalidInput(
                "sync.lease_ttl and sync.periodic_interval must be positive".to_string(),
            ));
        }
        if self.sync.lease_ttl <= self.sync.submit_timeout {
            return Err(Error::InvalidInput(
                "sync.lease_ttl must exceed sync.submit_timeout".to_string(),
            ));
        }
        if self.sync.max_passes == 0 {
            return Err(Error::InvalidInput(
                "sync.max_passes must be at least 1".to_string(),
            ));
        }
        if self.cache.ttl.is_zero() {
            return Err(Error::InvalidInput("cache.ttl must be positive".to_string()));
        }
        Ok(())
    }
}
