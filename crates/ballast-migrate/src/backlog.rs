//! Retry queue for reconciliations that did not complete.
//!
//! Objects stay durable locally when reconciliation fails; this backlog
//! keeps retrying the metadata update so pointers converge without an
//! operator re-running the migration.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::MigrateError;
use crate::reconcile::Reconciler;

/// Pending reconciliations, keyed by file name.
#[derive(Default)]
pub struct ReconcileBacklog {
    /// file name → origin address.
    pending: Mutex<BTreeMap<String, String>>,
}

impl ReconcileBacklog {
    /// Create an empty backlog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `file_name` for retry. A newer origin replaces an older one.
    pub fn push(&self, file_name: &str, origin: &str) {
        let mut pending = self.pending.lock().expect("backlog lock poisoned");
        pending.insert(file_name.to_string(), origin.to_string());
    }

    /// Number of queued reconciliations.
    pub fn len(&self) -> usize {
        self.pending.lock().expect("backlog lock poisoned").len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `file_name` is queued.
    pub fn contains(&self, file_name: &str) -> bool {
        self.pending
            .lock()
            .expect("backlog lock poisoned")
            .contains_key(file_name)
    }

    /// Retry every queued entry once. Returns how many remain.
    ///
    /// Entries that can never succeed (unparsable names, objects no longer
    /// held here) are dropped.
    pub async fn retry_once(&self, reconciler: &Reconciler) -> usize {
        let entries: Vec<(String, String)> = self
            .pending
            .lock()
            .expect("backlog lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (file_name, origin) in entries {
            let done = match reconciler.reconcile(&file_name, &origin).await {
                Ok(_) => {
                    info!(%file_name, "backlogged reconciliation succeeded");
                    true
                }
                Err(e @ (MigrateError::ObjectMissing(_) | MigrateError::InvalidName(_))) => {
                    warn!(%file_name, error = %e, "dropping unreconcilable entry");
                    true
                }
                Err(e) => {
                    debug!(%file_name, error = %e, "reconciliation still failing");
                    false
                }
            };
            if done {
                let mut pending = self.pending.lock().expect("backlog lock poisoned");
                // Only remove if no newer origin was queued meanwhile.
                if pending.get(&file_name) == Some(&origin) {
                    pending.remove(&file_name);
                }
            }
        }
        self.len()
    }

    /// Retry on `interval` until stopped.
    pub fn spawn_retry(self: &Arc<Self>, reconciler: Arc<Reconciler>, interval: Duration) -> BacklogHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let backlog = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !backlog.is_empty() {
                            let remaining = backlog.retry_once(&reconciler).await;
                            debug!(remaining, "reconcile backlog pass finished");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        BacklogHandle { shutdown_tx, task }
    }
}

/// Handle to a running backlog retry loop.
pub struct BacklogHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl BacklogHandle {
    /// Stop retrying and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}
