//! Control messages for a cache running in another execution context.
//!
//! Each request travels with its own response channel, so replies are
//! correlated without shared state. The worker answers every request
//! exactly once; the client bounds the wait with a timeout.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use scoresync_common::{Error, Result};

use crate::cache::{CacheStatus, PrimeReport, ResourceCache};

/// Requests understood by the cache worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    CacheClear,
    CacheStatus,
    CachePrime(Vec<String>),
    /// Take over from a previous worker generation immediately.
    SkipWaiting,
    Ping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlReply {
    Cleared(usize),
    Status(CacheStatus),
    Primed(PrimeReport),
    Activated,
    Pong,
    Error(String),
}

type Envelope = (ControlMessage, oneshot::Sender<ControlReply>);

/// Sending side, cheap to clone.
#[derive(Clone)]
pub struct ControlClient {
    tx: mpsc::Sender<Envelope>,
    timeout: Duration,
}

impl ControlClient {
    /// Send a request and wait for its reply.
    ///
    /// # Errors
    /// - `Error::Timeout` if no reply arrives in time
    /// - `Error::Cancelled` if the worker is gone
    pub async fn request(&self, message: ControlMessage) -> Result<ControlReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        debug!("Sending control message {:?}", message);

        let exchange = async {
            self.tx
                .send((message, reply_tx))
                .await
                .map_err(|_| Error::Cancelled("cache worker stopped".to_string()))?;
            reply_rx
                .await
                .map_err(|_| Error::Cancelled("cache worker dropped the request".to_string()))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(format!("no control reply within {:?}", self.timeout)))?
    }

    pub async fn clear(&self) -> Result<usize> {
        match self.request(ControlMessage::CacheClear).await? {
            ControlReply::Cleared(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> Result<CacheStatus> {
        match self.request(ControlMessage::CacheStatus).await? {
            ControlReply::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn prime(&self, paths: Vec<String>) -> Result<PrimeReport> {
        match self.request(ControlMessage::CachePrime(paths)).await? {
            ControlReply::Primed(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: ControlReply) -> Error {
    match reply {
        ControlReply::Error(message) => Error::Storage(message),
        other => Error::Serialization(format!("unexpected control reply {:?}", other)),
    }
}

/// Serves control messages against a cache.
pub struct CacheWorker {
    cache: Arc<ResourceCache>,
    rx: mpsc::Receiver<Envelope>,
    active: bool,
}

impl CacheWorker {
    /// Create a worker and the client talking to it.
    pub fn new(cache: Arc<ResourceCache>, timeout: Duration) -> (Self, ControlClient) {
        let (tx, rx) = mpsc::channel(32);
        (
            Self {
                cache,
                rx,
                active: false,
            },
            ControlClient { tx, timeout },
        )
    }

    /// Run until every client is dropped.
    pub async fn run(mut self) {
        info!("Cache worker started");
        while let Some((message, reply_tx)) = self.rx.recv().await {
            let reply = self.handle(message).await;
            if reply_tx.send(reply).is_err() {
                debug!("Control client went away before the reply");
            }
        }
        info!("Cache worker stopped");
    }

    async fn handle(&mut self, message: ControlMessage) -> ControlReply {
        match message {
            ControlMessage::CacheClear => match self.cache.clear_cache().await {
                Ok(n) => ControlReply::Cleared(n),
                Err(e) => failure("clear", e),
            },
            ControlMessage::CacheStatus => match self.cache.cache_status().await {
                Ok(status) => ControlReply::Status(status),
                Err(e) => failure("status", e),
            },
            ControlMessage::CachePrime(paths) => {
                ControlReply::Primed(self.cache.prime_cache(&paths).await)
            }
            ControlMessage::SkipWaiting => {
                if !self.active {
                    info!("Cache worker activated");
                    self.active = true;
                }
                ControlReply::Activated
            }
            ControlMessage::Ping => ControlReply::Pong,
        }
    }
}

fn failure(operation: &str, error: Error) -> ControlReply {
    warn!("Cache {} failed: {}", operation, error);
    ControlReply::Error(error.to_string())
}
