//! Sync status published to display layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Coarse state of the sync machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    Offline,
    /// Last drain ended with failures or the store is unavailable.
    Error,
}

/// Snapshot emitted on every relevant transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusSnapshot {
    pub is_online: bool,
    pub pending_count: usize,
    pub failed_count: usize,
    pub open_conflicts: usize,
    pub phase: SyncPhase,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Holder of the latest snapshot.
pub struct StatusPublisher {
    tx: watch::Sender<SyncStatusSnapshot>,
}

impl StatusPublisher {
    pub fn new(initial: SyncStatusSnapshot) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SyncStatusSnapshot {
        self.tx.borrow().clone()
    }

    /// Apply a change; subscribers are only woken if something differs.
    pub fn update(&self, change: impl FnOnce(&mut SyncStatusSnapshot)) {
        self.tx.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            change(snapshot);
            *snapshot != before
        });
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new(SyncStatusSnapshot::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unchanged_update_does_not_notify() {
        let publisher = StatusPublisher::default();
        let mut rx = publisher.subscribe();

        publisher.update(|s| s.phase = SyncPhase::Idle);
        assert!(!rx.has_changed().unwrap());

        publisher.update(|s| s.pending_count = 2);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().pending_count, 2);
    }
}
