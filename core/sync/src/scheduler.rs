//! Sync scheduling - manual, reconnect, enqueue and periodic triggers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use scoresync_common::{Error, Result};

use crate::connectivity::ConnectivityEvent;
use crate::orchestrator::{DrainReport, SyncOrchestrator};

/// What caused a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Manual,
    Reachable,
    Periodic,
    Enqueued,
}

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    Drain(SyncTrigger),
    /// Abort the drain in flight.
    Cancel,
    /// Shutdown the scheduler.
    Shutdown,
}

type Reply = oneshot::Sender<Result<DrainReport>>;

/// Request side of the scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<(SyncRequest, Option<Reply>)>,
}

impl SyncScheduler {
    /// Create a scheduler. `periodic` is the interval of background drains
    /// while online.
    pub fn new(periodic: Duration) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        (
            Self { request_tx },
            SyncSchedulerHandle {
                request_rx,
                periodic,
            },
        )
    }

    /// Request a drain and wait for its report.
    ///
    /// A request arriving while a drain is running is folded into it; the
    /// report then says `AlreadyRunning`.
    pub async fn request_sync(&self) -> Result<DrainReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SyncRequest::Drain(SyncTrigger::Manual), Some(response_tx))
            .await?;
        response_rx
            .await
            .map_err(|_| Error::Cancelled("scheduler dropped the sync request".to_string()))?
    }

    /// Ask for a drain without waiting for it.
    pub fn notify(&self, trigger: SyncTrigger) {
        if self
            .request_tx
            .try_send((SyncRequest::Drain(trigger), None))
            .is_err()
        {
            debug!("Scheduler busy or stopped, dropping {:?} trigger", trigger);
        }
    }

    pub async fn cancel(&self) -> Result<()> {
        self.send(SyncRequest::Cancel, None).await
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let _ = self.send(SyncRequest::Shutdown, None).await;
    }

    async fn send(&self, request: SyncRequest, reply: Option<Reply>) -> Result<()> {
        self.request_tx
            .send((request, reply))
            .await
            .map_err(|_| Error::Cancelled("scheduler not running".to_string()))
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    request_rx: mpsc::Receiver<(SyncRequest, Option<Reply>)>,
    periodic: Duration,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task until shutdown.
    ///
    /// This should be spawned in a tokio task. Drains run in their own tasks
    /// so cancellation requests are served while one is in flight.
    pub async fn run(
        mut self,
        orchestrator: Arc<SyncOrchestrator>,
        mut events: broadcast::Receiver<ConnectivityEvent>,
    ) {
        let mut ticker = interval_at(Instant::now() + self.periodic, self.periodic);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut drains = JoinSet::new();
        let mut listening = true;

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((SyncRequest::Drain(trigger), reply)) => {
                            debug!("Drain requested ({:?})", trigger);
                            spawn_drain(&mut drains, &orchestrator, trigger, reply);
                        }
                        Some((SyncRequest::Cancel, _)) => orchestrator.cancel_sync(),
                        Some((SyncRequest::Shutdown, _)) | None => {
                            info!("Sync scheduler shutting down");
                            break;
                        }
                    }
                }

                event = events.recv(), if listening => {
                    match event {
                        Ok(ConnectivityEvent::Reachable) => {
                            spawn_drain(&mut drains, &orchestrator, SyncTrigger::Reachable, None);
                        }
                        Ok(ConnectivityEvent::Unreachable) => orchestrator.cancel_sync(),
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("Missed {} connectivity events", skipped);
                        }
                        Err(RecvError::Closed) => listening = false,
                    }
                }

                _ = ticker.tick() => {
                    if orchestrator.is_online() {
                        spawn_drain(&mut drains, &orchestrator, SyncTrigger::Periodic, None);
                    } else {
                        debug!("Offline, skipping periodic drain");
                    }
                }

                Some(finished) = drains.join_next(), if !drains.is_empty() => {
                    if let Err(e) = finished {
                        error!("Drain task failed: {}", e);
                    }
                }
            }
        }

        orchestrator.cancel_sync();
        while drains.join_next().await.is_some() {}
    }
}

fn spawn_drain(
    drains: &mut JoinSet<()>,
    orchestrator: &Arc<SyncOrchestrator>,
    trigger: SyncTrigger,
    reply: Option<Reply>,
) {
    let orchestrator = orchestrator.clone();
    drains.spawn(async move {
        let result = orchestrator.drain().await;
        match &result {
            Ok(report) if report.skipped.is_none() => debug!(
                "{:?} drain completed: {} synced, {} failed, {} conflicts",
                trigger, report.synced, report.failed, report.conflicts
            ),
            Ok(_) => {}
            Err(e) => error!("{:?} drain failed: {}", trigger, e),
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionPayload, ActionStatus, ScoreMutation};
    use crate::authority::MemoryAuthority;
    use crate::connectivity::ConnectivityMonitor;
    use crate::queue::ActionQueue;
    use crate::status::StatusPublisher;
    use scoresync_common::{DeviceId, RetryConfig, SyncConfig};
    use scoresync_store::{DurableStore, MemoryStore};
    use tokio::time::sleep;

    struct Setup {
        monitor: Arc<ConnectivityMonitor>,
        authority: Arc<MemoryAuthority>,
        queue: Arc<ActionQueue>,
        scheduler: SyncScheduler,
        task: tokio::task::JoinHandle<()>,
    }

    fn setup(online: bool) -> Setup {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let authority = Arc::new(MemoryAuthority::new());
        let monitor = Arc::new(ConnectivityMonitor::start(online, Duration::from_millis(100)));
        let queue = Arc::new(ActionQueue::new(
            store.clone(),
            DeviceId::new("tablet-1").unwrap(),
            RetryConfig::new(3).with_jitter(false),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store,
            queue.clone(),
            authority.clone(),
            monitor.clone(),
            Arc::new(StatusPublisher::default()),
            SyncConfig::default(),
        ));

        let (scheduler, handle) = SyncScheduler::new(Duration::from_secs(10));
        let task = tokio::spawn(handle.run(orchestrator, monitor.subscribe()));
        Setup {
            monitor,
            authority,
            queue,
            scheduler,
            task,
        }
    }

    fn score() -> ActionPayload {
        ActionPayload::ScoreUpsert(ScoreMutation {
            score_id: "s-1".to_string(),
            competitor_id: "c-1".to_string(),
            criterion_id: "technique".to_string(),
            judge_id: "j-1".to_string(),
            value: 5.0,
            justification: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_request() {
        let s = setup(true);
        s.queue.enqueue(score()).await.unwrap();

        let report = s.scheduler.request_sync().await.unwrap();
        assert_eq!(report.synced, 1);

        s.scheduler.shutdown().await;
        s.task.await.unwrap();
        assert!(s.scheduler.request_sync().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_triggers_drain() {
        let s = setup(false);
        s.queue.enqueue(score()).await.unwrap();

        s.monitor.set_online(true);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(s.authority.submissions().len(), 1);
        s.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_only_while_online() {
        let s = setup(true);
        s.monitor.set_online(false);
        s.queue.enqueue(score()).await.unwrap();

        sleep(Duration::from_secs(35)).await;
        assert!(s.authority.submissions().is_empty());

        // Back online: the reachable event picks the queue up.
        s.monitor.set_online(true);
        sleep(Duration::from_secs(11)).await;
        assert_eq!(s.authority.submissions().len(), 1);
        s.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_cancels_drain() {
        let s = setup(true);
        s.authority.set_delay(Some(Duration::from_secs(30)));
        let action = s.queue.enqueue(score()).await.unwrap();

        s.scheduler.notify(SyncTrigger::Enqueued);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(
            s.queue.get(&action.id).await.unwrap().unwrap().status,
            ActionStatus::Syncing
        );

        s.monitor.set_online(false);
        sleep(Duration::from_secs(1)).await;
        let action = s.queue.get(&action.id).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert!(s.authority.submissions().is_empty());
        s.scheduler.shutdown().await;
    }
}
