//! Local durable store for scoresync.
//!
//! This module provides a trait-based interface over a transactional
//! key-value medium with several logical tables (actions, domain records,
//! conflicts, cache entries) and three backends:
//! - SQLite file for installations
//! - in-memory map for tests and ephemeral sessions
//! - an unavailable stand-in used when the medium cannot be opened
//!
//! # Design Principles
//! - Atomicity: multi-record writes go through a single [`WriteBatch`]
//! - Coordination: preconditions in a batch act as compare-and-swap, which is
//!   how separate execution contexts share leases and counters
//! - Degradation: a broken medium reports `Error::Storage`, it never panics

pub mod memory;
pub mod sqlite;
pub mod store;
pub mod unavailable;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SCHEMA_VERSION};
pub use store::{decode, encode, DurableStore, IndexFilter, StoredRecord, Table, WriteBatch, WriteOp};
pub use unavailable::UnavailableStore;

use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Open the durable store for an installation.
///
/// `None` yields an in-memory store. If the SQLite file cannot be opened the
/// returned store is an [`UnavailableStore`], so callers run without offline
/// capability instead of failing.
pub fn open_store(path: Option<&Path>) -> Arc<dyn DurableStore> {
    let Some(path) = path else {
        return Arc::new(MemoryStore::new());
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Cannot create store directory {}: {}", parent.display(), e);
                return Arc::new(UnavailableStore::new(e.to_string()));
            }
        }
    }

    match SqliteStore::open(path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(
                "Durable store at {} unavailable, offline capability disabled: {}",
                path.display(),
                e
            );
            Arc::new(UnavailableStore::new(e.to_string()))
        }
    }
}
