//! Error types for rebalancing operations.

use ballast_types::NodeId;

/// Errors from the external metadata service.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// The HTTP request failed or its body could not be decoded.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The replica answered with a non-success status.
    #[error("replica {replica} returned {status}: {body}")]
    Status {
        /// Replica address.
        replica: String,
        /// HTTP status code.
        status: u16,
        /// Response body, for the operator.
        body: String,
    },

    /// Injected or transport-level failure without an HTTP response.
    #[error("metadata replica {replica} unavailable: {reason}")]
    Unavailable {
        /// Replica address.
        replica: String,
        /// What went wrong.
        reason: String,
    },
}

/// Errors that can occur while planning, moving or reconciling objects.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Excluding this node, nobody is left to rebalance with.
    #[error("no peers available")]
    NoPeersAvailable,

    /// A planned peer has no record in the peer directory.
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),

    /// Local objects remain after every target's quota was filled.
    #[error("server depleted: {unsent_bytes} bytes could not be placed on any target")]
    ServerDepleted {
        /// Bytes left behind.
        unsent_bytes: u64,
    },

    /// Some objects failed to transfer; the rest moved.
    #[error("migration degraded: {failed} of {total} objects failed, see logs for detail")]
    Degraded {
        /// Objects that failed.
        failed: usize,
        /// Objects attempted.
        total: usize,
    },

    /// Too many metadata location updates failed.
    #[error("too many failures updating metadata ({failed}/{total})")]
    ReconciliationDegraded {
        /// Update calls that failed.
        failed: usize,
        /// Update calls issued.
        total: usize,
    },

    /// No metadata replica is registered in service discovery.
    #[error("no metadata replicas available")]
    NoMetadataReplicas,

    /// A received object is not present locally.
    #[error("object {0} does not exist locally")]
    ObjectMissing(String),

    /// Another join, leave or send is already running on this node.
    #[error("rebalance already in progress")]
    Busy,

    /// A peer rejected a request.
    #[error("peer {peer} rejected request: {message}")]
    Rejected {
        /// Transfer address of the peer.
        peer: String,
        /// The peer's failure message.
        message: String,
    },

    /// A blob name did not parse.
    #[error(transparent)]
    InvalidName(#[from] ballast_types::TypeError),

    /// Local store failure.
    #[error("store error: {0}")]
    Store(#[from] ballast_store::StoreError),

    /// Coordination-store failure.
    #[error("coordination error: {0}")]
    Coord(#[from] ballast_coord::CoordError),

    /// Transport failure.
    #[error("network error: {0}")]
    Net(#[from] ballast_net::NetError),

    /// Metadata-service failure.
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
}
