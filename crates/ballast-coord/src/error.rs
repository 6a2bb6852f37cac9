//! Error types for coordination-store operations.

/// Errors that can occur while talking to the coordination store.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// The etcd client reported an error.
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// A stored value could not be decoded.
    #[error("invalid value at {key}: {reason}")]
    InvalidValue {
        /// Key holding the bad value.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A record could not be serialized for storage.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
