//! Capacity Tracker persistence.
//!
//! Each node publishes its [`CapacityCounter`] as a decimal string under
//! `capacity/<group>/<nodeId>` and reads the whole group's counters with
//! one prefix read when planning a rebalance.

use std::sync::Arc;
use std::time::Duration;

use ballast_store::CapacityCounter;
use ballast_types::{CapacitySnapshot, NodeId};
use tracing::{debug, info, warn};

use crate::error::CoordError;
use crate::keys;
use crate::traits::Coordinator;

/// Configuration for the periodic capacity reporter.
#[derive(Debug, Clone)]
pub struct CapacityReporterConfig {
    /// How often the counter is written to the coordination store.
    pub sync_interval: Duration,
}

impl CapacityReporterConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            sync_interval: Duration::from_millis(50),
        }
    }
}

impl Default for CapacityReporterConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
        }
    }
}

/// Reads and writes capacity counters for one node of one group.
pub struct CapacityTracker {
    coord: Arc<dyn Coordinator>,
    group: String,
    node_id: NodeId,
    counter: Arc<CapacityCounter>,
}

impl CapacityTracker {
    /// Create a tracker for `node_id` publishing `counter`.
    pub fn new(
        coord: Arc<dyn Coordinator>,
        group: impl Into<String>,
        node_id: NodeId,
        counter: Arc<CapacityCounter>,
    ) -> Self {
        Self {
            coord,
            group: group.into(),
            node_id,
            counter,
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The live counter.
    pub fn counter(&self) -> &Arc<CapacityCounter> {
        &self.counter
    }

    /// Write the current counter value.
    pub async fn save(&self) -> Result<(), CoordError> {
        let bytes = self.counter.bytes();
        self.coord
            .put(
                &keys::capacity_key(&self.group, &self.node_id),
                &bytes.to_string(),
            )
            .await?;
        debug!(node = %self.node_id, bytes, "saved capacity");
        Ok(())
    }

    /// Remove this node's counter from the group.
    pub async fn clear(&self) -> Result<(), CoordError> {
        self.coord
            .delete(&keys::capacity_key(&self.group, &self.node_id))
            .await
    }

    /// Read every node's byte count in the group.
    ///
    /// Unparsable values are logged and skipped. This node's entry always
    /// reflects the live counter, whether or not it has been saved yet.
    pub async fn snapshot(&self) -> Result<CapacitySnapshot, CoordError> {
        let prefix = keys::capacity_prefix(&self.group);
        let mut snapshot = CapacitySnapshot::new();
        for (key, value) in self.coord.get_prefix(&prefix).await? {
            let Some(id) = key.strip_prefix(&prefix) else {
                continue;
            };
            match value.trim().parse::<i64>() {
                Ok(bytes) => snapshot.insert(NodeId::from(id), bytes.max(0) as u64),
                Err(e) => warn!(%key, %value, error = %e, "ignoring unparsable capacity"),
            }
        }
        snapshot.insert(self.node_id.clone(), self.counter.bytes());
        Ok(snapshot)
    }

    /// Start saving the counter on `config.sync_interval`.
    ///
    /// The first save happens immediately.
    pub fn spawn_reporter(self: &Arc<Self>, config: CapacityReporterConfig) -> ReporterHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let tracker = self.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.sync_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = tracker.save().await {
                            warn!(error = %e, "failed to save capacity");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        ReporterHandle {
            tracker: self.clone(),
            shutdown_tx,
            task,
        }
    }
}

/// Handle to a running capacity reporter.
pub struct ReporterHandle {
    tracker: Arc<CapacityTracker>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ReporterHandle {
    /// Stop reporting.
    ///
    /// With `leaving` the node's key is deleted so peers stop counting it;
    /// otherwise a final value is saved for the next start.
    pub async fn stop(self, leaving: bool) -> Result<(), CoordError> {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
        if leaving {
            self.tracker.clear().await?;
            info!(node = %self.tracker.node_id, "capacity withdrawn");
        } else {
            self.tracker.save().await?;
        }
        Ok(())
    }

    /// Whether the background task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
