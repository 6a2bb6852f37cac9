//! The responder side of the locate protocol.

use std::sync::Arc;
use std::time::Duration;

use ballast_coord::{Coordinator, Watch, WatchEvent, keys};
use ballast_store::ObjectStore;
use ballast_types::{LocateRequest, LocateResponse};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::LocateError;

/// Configuration for the locate responder.
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Delay before re-subscribing after the watch is dropped.
    pub resubscribe_backoff: Duration,
    /// Upper bound for the doubled backoff.
    pub max_backoff: Duration,
}

impl LocatorConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            resubscribe_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        }
    }
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            resubscribe_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Handle to a running responder loop.
pub struct LocatorHandle {
    cancel_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl LocatorHandle {
    /// Stop answering. Safe to call more than once.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Cancel and wait for the loop to exit.
    pub async fn stop(self) {
        self.cancel();
        let _ = self.task.await;
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

struct Locator {
    coord: Arc<dyn Coordinator>,
    store: Arc<ObjectStore>,
    key: String,
    self_addr: String,
    config: LocatorConfig,
    cancel_rx: watch::Receiver<bool>,
}

/// `StartLocate(selfAddress)`: answer locate requests for blobs in `store`.
///
/// The broadcast key is created if missing and the first subscription is
/// open before this returns, so requests written afterwards are seen.
pub async fn start_locate(
    coord: Arc<dyn Coordinator>,
    store: Arc<ObjectStore>,
    group: &str,
    self_addr: impl Into<String>,
    config: LocatorConfig,
) -> Result<LocatorHandle, LocateError> {
    let key = keys::locate_broadcast_key(group);
    if coord.put_if_absent(&key, "").await? {
        debug!(%key, "created locate broadcast key");
    }
    let watch = coord.watch(&key).await?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let locator = Locator {
        coord,
        store,
        key,
        self_addr: self_addr.into(),
        config,
        cancel_rx,
    };
    let task = tokio::spawn(locator.run(watch));
    Ok(LocatorHandle { cancel_tx, task })
}

impl Locator {
    async fn run(mut self, mut watch: Watch) {
        info!(key = %self.key, addr = %self.self_addr, "locate responder started");
        loop {
            let event = tokio::select! {
                event = watch.next() => event,
                _ = self.cancel_rx.changed() => break,
            };
            match event {
                Some(WatchEvent::Put { value, .. }) => self.dispatch(&value),
                Some(WatchEvent::Delete { .. }) => {}
                None => match self.resubscribe().await {
                    Some(w) => watch = w,
                    None => break,
                },
            }
        }
        info!(key = %self.key, "locate responder stopped");
    }

    /// Re-open the watch with backoff. `None` once cancelled.
    async fn resubscribe(&mut self) -> Option<Watch> {
        let mut backoff = self.config.resubscribe_backoff;
        loop {
            warn!(key = %self.key, ?backoff, "locate watch closed, re-subscribing");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.cancel_rx.changed() => return None,
            }
            if *self.cancel_rx.borrow() {
                return None;
            }
            match self.coord.watch(&self.key).await {
                Ok(watch) => {
                    info!(key = %self.key, "locate watch re-established");
                    return Some(watch);
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "re-subscribe failed");
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    fn dispatch(&self, raw: &str) {
        if raw.is_empty() {
            return;
        }
        let request = match LocateRequest::parse(raw) {
            Ok(request) => request,
            Err(e) => {
                warn!(value = %raw, error = %e, "dropping malformed locate request");
                return;
            }
        };

        let coord = self.coord.clone();
        let store = self.store.clone();
        let self_addr = self.self_addr.clone();
        tokio::spawn(async move {
            let LocateRequest { object, reply_key } = request;
            match store.exists(&object).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!(%object, error = %e, "existence check failed");
                    return;
                }
            }
            let response = LocateResponse {
                address: self_addr,
                shard: object.shard,
            };
            match coord.put(&reply_key, &response.encode()).await {
                Ok(()) => debug!(%object, %reply_key, "answered locate request"),
                Err(e) => warn!(%object, %reply_key, error = %e, "failed to answer locate request"),
            }
        });
    }
}
