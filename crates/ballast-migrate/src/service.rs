//! Membership commands and the node-side RPC surface.

use std::sync::Arc;

use async_trait::async_trait;
use ballast_coord::{CapacityTracker, PeerDirectory, ReporterHandle};
use ballast_net::{Ack, ChunkSink, MigrationMessage, MigrationTransport, ObjectDescriptor, RpcHandler};
use ballast_types::PeerInfo;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::deviation::{DeviationCalculator, DeviationPlan};
use crate::error::MigrateError;
use crate::receiver::Receiver;
use crate::sender::{MigrationSender, SendReport};

/// Drives join, leave and `RequireSend` for one node and serves its
/// inbound transfer streams.
///
/// At most one rebalance (join, leave or send) runs at a time; a second
/// request is refused with [`MigrateError::Busy`] rather than queued.
pub struct MigrationService {
    self_info: PeerInfo,
    rebalance: Mutex<()>,
    peers: PeerDirectory,
    capacity: Arc<CapacityTracker>,
    reporter: Mutex<Option<ReporterHandle>>,
    transport: Arc<dyn MigrationTransport>,
    sender: MigrationSender,
    receiver: Receiver,
    deviation: DeviationCalculator,
}

impl MigrationService {
    /// Assemble the service.
    ///
    /// `reporter` is the running capacity reporter, stopped on leave.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_info: PeerInfo,
        peers: PeerDirectory,
        capacity: Arc<CapacityTracker>,
        reporter: Option<ReporterHandle>,
        transport: Arc<dyn MigrationTransport>,
        sender: MigrationSender,
        receiver: Receiver,
    ) -> Self {
        let deviation = DeviationCalculator::new(capacity.clone(), peers.clone());
        Self {
            self_info,
            rebalance: Mutex::new(()),
            peers,
            capacity,
            reporter: Mutex::new(reporter),
            transport,
            sender,
            receiver,
            deviation,
        }
    }

    /// This node's directory record.
    pub fn self_info(&self) -> &PeerInfo {
        &self.self_info
    }

    /// The receive side, shared with the server loop.
    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    /// `JoinCommand`: register, then ask every over-average peer to send
    /// its surplus here.
    #[tracing::instrument(skip(self), fields(node = %self.self_info.node_id))]
    pub async fn join(&self) -> Result<(), MigrateError> {
        let _guard = self.rebalance.try_lock().map_err(|_| MigrateError::Busy)?;

        self.peers.register(&self.self_info).await?;
        let plan = self.deviation.compute(true).await?;
        if plan.is_empty() {
            info!("cluster already balanced, nothing to pull");
            return Ok(());
        }

        let target = self.self_info.transfer_addr();
        let mut requests = JoinSet::new();
        for (peer, bytes) in plan {
            let transport = self.transport.clone();
            let target = target.clone();
            requests.spawn(async move {
                let request = MigrationMessage::RequireSend {
                    required_bytes: bytes,
                    target,
                };
                let result = transport.call(&peer, request).await;
                (peer, bytes, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = requests.join_next().await {
            let (peer, bytes, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "require-send task panicked");
                    first_error.get_or_insert(MigrateError::Rejected {
                        peer: "unknown".to_string(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            let err = match result {
                Ok(ack) if ack.success => {
                    info!(%peer, bytes, "peer sent its surplus");
                    continue;
                }
                Ok(ack) => MigrateError::Rejected {
                    peer: peer.clone(),
                    message: ack.message,
                },
                Err(e) => e.into(),
            };
            warn!(%peer, bytes, error = %err, "peer failed to send");
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// `LeaveCommand`: plan, leave the directory and capacity table, then
    /// push every local object to the remaining peers.
    #[tracing::instrument(skip(self), fields(node = %self.self_info.node_id))]
    pub async fn leave(&self) -> Result<SendReport, MigrateError> {
        let _guard = self.rebalance.try_lock().map_err(|_| MigrateError::Busy)?;

        let plan = self.deviation.compute(false).await?;
        self.peers.deregister(&self.self_info.node_id).await?;
        match self.reporter.lock().await.take() {
            Some(reporter) => reporter.stop(true).await?,
            None => self.capacity.clear().await?,
        }
        // Only an empty node yields an empty plan.
        if plan.is_empty() {
            info!("nothing to drain");
            return Ok(SendReport::default());
        }
        self.sender.send_to(plan).await
    }

    /// Stop capacity reporting for a daemon shutdown.
    ///
    /// A node that is still a member saves its final counter. After a leave
    /// the reporter is gone and the capacity key stays withdrawn.
    pub async fn shutdown(&self) -> Result<(), MigrateError> {
        match self.reporter.lock().await.take() {
            Some(reporter) => reporter.stop(false).await?,
            None => debug!("no capacity reporter running"),
        }
        Ok(())
    }

    /// `RequireSend(requiredBytes, target)`.
    #[tracing::instrument(skip(self))]
    pub async fn require_send(
        &self,
        required_bytes: u64,
        target: String,
    ) -> Result<SendReport, MigrateError> {
        let _guard = self.rebalance.try_lock().map_err(|_| MigrateError::Busy)?;
        let plan: DeviationPlan = [(target, required_bytes)].into_iter().collect();
        self.sender.send_quota(plan).await
    }
}

#[async_trait]
impl RpcHandler for MigrationService {
    async fn receive_session(&self) -> Box<dyn ChunkSink> {
        Box::new(self.receiver.session())
    }

    async fn finish_receive(&self, object: ObjectDescriptor) -> Ack {
        Ack::from_result(self.receiver.finish_receive(&object).await)
    }

    async fn require_send(&self, required_bytes: u64, target: String) -> Ack {
        Ack::from_result(
            MigrationService::require_send(self, required_bytes, target)
                .await
                .map(drop),
        )
    }

    async fn join(&self) -> Ack {
        Ack::from_result(MigrationService::join(self).await)
    }

    async fn leave(&self) -> Ack {
        Ack::from_result(MigrationService::leave(self).await.map(drop))
    }
}
