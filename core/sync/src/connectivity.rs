//! Network reachability signal with debounced transition events.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

/// A reachability transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Online for a full quiet period. Emitted once per outage.
    Reachable,
    /// Went offline after having been announced online.
    Unreachable,
}

/// Source of the platform reachability signal.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Exposes `is_online` and a stream of debounced transitions.
///
/// `is_online` is a hint; requests can still fail while it reads `true`.
pub struct ConnectivityMonitor {
    signal: watch::Sender<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    /// Start monitoring from the platform's current state.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(initially_online: bool, debounce: Duration) -> Self {
        let (signal, rx) = watch::channel(initially_online);
        let (events, _) = broadcast::channel(32);
        let debouncer = tokio::spawn(debounce_loop(
            rx,
            events.clone(),
            initially_online,
            debounce,
        ));

        Self {
            signal,
            events,
            tasks: Mutex::new(vec![debouncer]),
        }
    }

    /// Raw signal.
    pub fn is_online(&self) -> bool {
        *self.signal.borrow()
    }

    /// Feed a new platform reading. Repeated readings are ignored.
    pub fn set_online(&self, online: bool) {
        let changed = self.signal.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!("Reachability signal is now {}", online);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Receiver of the raw signal.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Poll a probe periodically and feed its answers into the signal.
    pub fn spawn_probe(self: &Arc<Self>, probe: Arc<dyn ReachabilityProbe>, every: Duration) {
        let monitor = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = probe.probe().await;
                match monitor.upgrade() {
                    Some(monitor) => monitor.set_online(online),
                    None => break,
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn debounce_loop(
    mut rx: watch::Receiver<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
    mut announced: bool,
    debounce: Duration,
) {
    // `announced` is the state at creation; readings sent before this task
    // first runs still show up as a change.

    loop {
        if rx.changed().await.is_err() {
            return;
        }
        let online = *rx.borrow_and_update();

        if !online {
            if announced {
                announced = false;
                info!("Connectivity lost");
                let _ = events.send(ConnectivityEvent::Unreachable);
            }
            continue;
        }
        if announced {
            continue;
        }

        // Wait for a quiet period; any flap restarts the wait.
        let settled = loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !*rx.borrow_and_update() {
                        break false;
                    }
                }
                _ = sleep(debounce) => break true,
            }
        };

        if settled {
            announced = true;
            info!("Connectivity restored");
            let _ = events.send(ConnectivityEvent::Reachable);
        }
    }
}
