//! Deviation Calculator.
//!
//! Decides how many bytes must move between this node and each peer when
//! the node joins or leaves. Given the byte counts `cap` of the current
//! members:
//!
//! ```text
//! group = joining ? len(cap) + 1 : len(cap) - 1
//! avg   = ceil(sum(cap) / group)
//! delta = joining ? cap[p] - avg : avg - cap[p]     (p != self, delta > 0)
//! ```
//!
//! Joining, `delta` is what peer `p` should send to this node; leaving, it
//! is what this node should send to `p`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ballast_coord::{CapacityTracker, PeerDirectory};
use ballast_types::{CapacitySnapshot, NodeId};
use tracing::{debug, info};

use crate::error::MigrateError;

/// Transfer address → bytes, as consumed by the sender or by `RequireSend`.
pub type DeviationPlan = HashMap<String, u64>;

/// Compute per-peer deltas from a capacity snapshot.
///
/// When joining, this node is not yet a member, so any entry for it in the
/// snapshot is ignored. When leaving it is counted in the total.
pub fn compute_deltas(
    snapshot: &CapacitySnapshot,
    self_id: &NodeId,
    joining: bool,
) -> Result<BTreeMap<NodeId, u64>, MigrateError> {
    let members: BTreeMap<&NodeId, u64> = snapshot
        .iter()
        .filter(|(id, _)| !(joining && *id == self_id))
        .collect();

    let candidates = members.keys().filter(|id| **id != self_id).count();
    if candidates == 0 {
        return Err(MigrateError::NoPeersAvailable);
    }

    let group_size = if joining {
        members.len() + 1
    } else {
        members.len() - 1
    } as u64;
    if group_size == 0 {
        return Err(MigrateError::NoPeersAvailable);
    }

    let total: u64 = members.values().sum();
    let avg = total.div_ceil(group_size);

    let deltas = members
        .into_iter()
        .filter(|(id, _)| *id != self_id)
        .filter_map(|(id, cap)| {
            let delta = if joining {
                cap.checked_sub(avg)
            } else {
                avg.checked_sub(cap)
            }?;
            (delta > 0).then(|| (id.clone(), delta))
        })
        .collect();

    debug!(%self_id, joining, total, group_size, avg, "computed deviation");
    Ok(deltas)
}

/// Combines the capacity snapshot with peer addresses to produce a plan.
#[derive(Clone)]
pub struct DeviationCalculator {
    capacity: Arc<CapacityTracker>,
    peers: PeerDirectory,
}

impl DeviationCalculator {
    /// Create a calculator for the node `capacity` tracks.
    pub fn new(capacity: Arc<CapacityTracker>, peers: PeerDirectory) -> Self {
        Self { capacity, peers }
    }

    /// `ComputeDeviation(joining)`.
    ///
    /// Every planned peer must resolve to a transfer address; if any does
    /// not, the whole plan is rejected with [`MigrateError::UnknownPeer`].
    pub async fn compute(&self, joining: bool) -> Result<DeviationPlan, MigrateError> {
        let self_id = self.capacity.node_id();
        let snapshot = self.capacity.snapshot().await?;
        let deltas = compute_deltas(&snapshot, self_id, joining)?;

        let mut plan = DeviationPlan::with_capacity(deltas.len());
        for (id, delta) in deltas {
            let info = self
                .peers
                .resolve(&id)
                .await?
                .ok_or_else(|| MigrateError::UnknownPeer(id.clone()))?;
            plan.insert(info.transfer_addr(), delta);
        }

        info!(
            joining,
            peers = plan.len(),
            bytes = plan.values().sum::<u64>(),
            "deviation plan ready"
        );
        Ok(plan)
    }
}
