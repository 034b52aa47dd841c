//! Common utilities and types shared across the scoresync crates.
//!
//! This module provides the error taxonomy, identifier types and client
//! configuration used by the durable store, the sync engine and the CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    CacheConfig, ClientConfig, ConnectivityConfig, RetentionConfig, RetryConfig, SyncConfig,
};
pub use error::{Error, Result};
pub use types::{ActionId, ConflictId, DeviceId, ResourceKey};
