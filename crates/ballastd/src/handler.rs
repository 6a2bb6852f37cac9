//! Incoming protocol handler for the ballast daemon.
//!
//! Implements iroh's [`ProtocolHandler`] trait: every bi-stream a peer opens
//! on an accepted connection is one transfer exchange, served by the
//! node's [`MigrationService`].
//!
//! [`ProtocolHandler`]: iroh::protocol::ProtocolHandler

use std::fmt;
use std::sync::Arc;

use ballast_migrate::MigrationService;
use ballast_net::serve_stream;
use iroh::endpoint::Connection;
use iroh::protocol::AcceptError;
use tracing::{debug, warn};

/// Serves transfer RPC on connections routed by the iroh
/// [`Router`](iroh::protocol::Router).
pub struct TransferProtocol {
    service: Arc<MigrationService>,
}

impl fmt::Debug for TransferProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferProtocol").finish_non_exhaustive()
    }
}

impl TransferProtocol {
    /// Create a handler dispatching to `service`.
    pub fn new(service: Arc<MigrationService>) -> Self {
        Self { service }
    }
}

impl iroh::protocol::ProtocolHandler for TransferProtocol {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let remote = conn.remote_id();
        debug!(remote = %remote.fmt_short(), "transfer connection accepted");

        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(remote = %remote.fmt_short(), error = %e, "connection closed");
                    break;
                }
            };
            let service = self.service.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_stream(service.as_ref(), send, recv).await {
                    warn!(remote = %remote.fmt_short(), error = %e, "transfer stream failed");
                }
            });
        }
        Ok(())
    }
}
