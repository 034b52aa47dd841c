//! Scoresync Sync Engine
//!
//! This module provides offline-first synchronization for scoresync clients, including:
//! - Durable action queue with per-resource FIFO ordering
//! - Connectivity monitoring with debounced transitions
//! - Resource caching (cache-first, network-first, stale-while-revalidate)
//! - Single-flight drain against the remote authority
//! - Conflict detection and resolution with an audit trail
//! - Retry strategy with exponential backoff

pub mod action;
pub mod authority;
pub mod cache;
pub mod client;
pub mod conflict;
pub mod connectivity;
pub mod device;
pub mod http;
pub mod lease;
pub mod messaging;
pub mod orchestrator;
pub mod queue;
pub mod record;
pub mod retry;
pub mod rules;
pub mod scheduler;
pub mod status;

// Re-export main types
pub use action::{
    ActionKind, ActionPayload, ActionStatus, EvaluationMutation, OfflineAction, ScoreMutation,
};
pub use authority::{MemoryAuthority, RemoteAuthority, RemoteRecord, SubmitOutcome, SubmitRequest};
pub use cache::{
    CachePolicy, CacheResponse, CacheSource, CacheStatus, FetchedResource, PolicyTable,
    PrimeReport, ResourceCache, ResourceFetcher,
};
pub use client::{OfflineClient, OfflineClientBuilder, PruneReport};
pub use conflict::{Conflict, ConflictResolver, ConflictState, ConflictStore, ResolutionStrategy};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ReachabilityProbe};
pub use device::DeviceIdentity;
pub use http::{HttpAuthority, HttpFetcher};
pub use lease::{DrainLease, LeaseRecord};
pub use messaging::{CacheWorker, ControlClient, ControlMessage, ControlReply};
pub use orchestrator::{DrainReport, SkipReason, SyncOrchestrator};
pub use queue::ActionQueue;
pub use record::{DomainRecord, RecordStore};
pub use retry::{Backoff, RetryExecutor};
pub use rules::{PayloadValidator, ScoreRules};
pub use scheduler::{SyncRequest, SyncScheduler, SyncSchedulerHandle, SyncTrigger};
pub use status::{StatusPublisher, SyncPhase, SyncStatusSnapshot};
