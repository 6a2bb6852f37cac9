//! Peer Directory: node id → advertised addresses.

use std::collections::HashMap;
use std::sync::Arc;

use ballast_types::{NodeId, PeerInfo};
use tracing::{info, warn};

use crate::error::CoordError;
use crate::keys;
use crate::traits::Coordinator;

/// Reads and writes peer records of one group.
///
/// Records are JSON-encoded [`PeerInfo`] values under `peers/<group>/<id>`.
#[derive(Clone)]
pub struct PeerDirectory {
    coord: Arc<dyn Coordinator>,
    group: String,
}

impl PeerDirectory {
    /// Create a directory view for `group`.
    pub fn new(coord: Arc<dyn Coordinator>, group: impl Into<String>) -> Self {
        Self {
            coord,
            group: group.into(),
        }
    }

    /// Publish this node's record.
    pub async fn register(&self, info: &PeerInfo) -> Result<(), CoordError> {
        let value = serde_json::to_string(info)?;
        self.coord
            .put(&keys::peer_key(&self.group, &info.node_id), &value)
            .await?;
        info!(node = %info.node_id, addr = %info.transfer_addr(), "registered peer");
        Ok(())
    }

    /// Remove a node's record.
    pub async fn deregister(&self, node: &NodeId) -> Result<(), CoordError> {
        self.coord.delete(&keys::peer_key(&self.group, node)).await?;
        info!(%node, "deregistered peer");
        Ok(())
    }

    /// Look up one node.
    pub async fn resolve(&self, node: &NodeId) -> Result<Option<PeerInfo>, CoordError> {
        let key = keys::peer_key(&self.group, node);
        let Some(raw) = self.coord.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CoordError::InvalidValue {
                key,
                reason: e.to_string(),
            })
    }

    /// Every registered peer, keyed by id. Undecodable records are skipped.
    pub async fn peer_map(&self) -> Result<HashMap<NodeId, PeerInfo>, CoordError> {
        let prefix = keys::peer_prefix(&self.group);
        let mut peers = HashMap::new();
        for (key, raw) in self.coord.get_prefix(&prefix).await? {
            match serde_json::from_str::<PeerInfo>(&raw) {
                Ok(info) => {
                    peers.insert(info.node_id.clone(), info);
                }
                Err(e) => warn!(%key, error = %e, "ignoring undecodable peer record"),
            }
        }
        Ok(peers)
    }
}
