//! Location Reconciliation.
//!
//! After an object lands here, metadata records that still say it lives at
//! the origin node are repointed at this node. The update is best effort:
//! it fails only when at least half of the update calls fail.

use std::collections::HashMap;
use std::sync::Arc;

use ballast_coord::ServiceDiscovery;
use ballast_store::ObjectStore;
use ballast_types::{ObjectName, Version};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{MetadataError, MigrateError};
use crate::metadata::MetadataService;

/// Whether `failed` out of `total` update calls is too many.
///
/// Failure once `failed >= ceil(total / 2)`; a run with no calls never fails.
pub fn too_many_failures(failed: usize, total: usize) -> bool {
    total > 0 && failed >= total.div_ceil(2)
}

/// Outcome of a reconciliation that did not fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Update calls that succeeded.
    pub updated: usize,
    /// Update calls that failed (tolerated).
    pub failed: usize,
}

/// Repoints metadata at this node for objects it has received.
pub struct Reconciler {
    store: Arc<ObjectStore>,
    metadata: Arc<dyn MetadataService>,
    discovery: ServiceDiscovery,
    meta_service: String,
    /// This node's data-plane address.
    self_addr: String,
}

impl Reconciler {
    /// Create a reconciler.
    ///
    /// Metadata replicas are looked up under `meta_service` on every call.
    pub fn new(
        store: Arc<ObjectStore>,
        metadata: Arc<dyn MetadataService>,
        discovery: ServiceDiscovery,
        meta_service: impl Into<String>,
        self_addr: impl Into<String>,
    ) -> Self {
        Self {
            store,
            metadata,
            discovery,
            meta_service: meta_service.into(),
            self_addr: self_addr.into(),
        }
    }

    /// `Reconcile(fileName, originAddress)`.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(
        &self,
        file_name: &str,
        origin: &str,
    ) -> Result<ReconcileReport, MigrateError> {
        let name: ObjectName = file_name.parse()?;
        let replicas = self.discovery.addresses(&self.meta_service).await?;
        if replicas.is_empty() {
            return Err(MigrateError::NoMetadataReplicas);
        }

        let stale = self.stale_versions(&name, origin, replicas).await?;
        if stale.is_empty() {
            info!(%name, %origin, "no metadata points at origin, nothing to update");
            return Ok(ReconcileReport::default());
        }

        if !self.store.exists(&name).await? {
            return Err(MigrateError::ObjectMissing(file_name.to_string()));
        }

        let total: usize = stale.values().map(Vec::len).sum();
        let mut updates = JoinSet::new();
        for (replica, versions) in stale {
            let metadata = self.metadata.clone();
            updates.spawn(async move {
                let mut succeeded = 0usize;
                for version in versions {
                    match metadata
                        .update_locations(
                            &replica,
                            &version.name,
                            version.sequence,
                            &version.locations,
                        )
                        .await
                    {
                        Ok(()) => succeeded += 1,
                        Err(e) => warn!(
                            %replica,
                            version = %version.name,
                            sequence = version.sequence,
                            error = %e,
                            "metadata location update failed"
                        ),
                    }
                }
                succeeded
            });
        }

        // Calls from a panicked task count as failed.
        let mut succeeded = 0usize;
        while let Some(joined) = updates.join_next().await {
            match joined {
                Ok(n) => succeeded += n,
                Err(e) => warn!(error = %e, "update task panicked"),
            }
        }
        let failed = total - succeeded;

        if too_many_failures(failed, total) {
            return Err(MigrateError::ReconciliationDegraded { failed, total });
        }
        info!(%name, updated = total - failed, failed, "metadata reconciled");
        Ok(ReconcileReport {
            updated: total - failed,
            failed,
        })
    }

    /// Query every replica and keep versions whose shard slot still names
    /// `origin`, already rewritten to point here. Any query failure aborts.
    async fn stale_versions(
        &self,
        name: &ObjectName,
        origin: &str,
        replicas: Vec<String>,
    ) -> Result<HashMap<String, Vec<Version>>, MigrateError> {
        let mut queries = JoinSet::new();
        for replica in replicas {
            let metadata = self.metadata.clone();
            let hash = name.hash.clone();
            queries.spawn(async move {
                let result = metadata.versions_by_hash(&replica, &hash).await;
                (replica, result)
            });
        }

        let mut stale: HashMap<String, Vec<Version>> = HashMap::new();
        while let Some(joined) = queries.join_next().await {
            let (replica, result) = joined.map_err(|e| MetadataError::Unavailable {
                replica: "unknown".to_string(),
                reason: e.to_string(),
            })?;
            for mut version in result? {
                let Some(slot) = version.locations.get_mut(name.shard) else {
                    continue;
                };
                if slot.as_str() == origin {
                    *slot = self.self_addr.clone();
                    stale.entry(replica.clone()).or_default().push(version);
                }
            }
        }
        Ok(stale)
    }
}
