//! Error types for local object storage.

use ballast_types::{ObjectName, TypeError};

/// Errors that can occur during object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object is not stored locally.
    #[error("object not found: {0}")]
    NotFound(ObjectName),

    /// A file name did not have the `<hash>.<shardIndex>` shape.
    #[error(transparent)]
    InvalidName(#[from] TypeError),

    /// Another receive for the same object is already writing its temp file.
    #[error("receive already in progress for {0}")]
    ReceiveInProgress(ObjectName),

    /// More bytes were offered for a pending object than it declared.
    #[error("object {name} overflows declared size {declared} (got {received} bytes)")]
    Overflow {
        /// The object being received.
        name: ObjectName,
        /// Size announced on the first chunk.
        declared: u64,
        /// Bytes received so far, including the rejected chunk.
        received: u64,
    },

    /// A pending object was committed before all declared bytes arrived.
    #[error("object {name} incomplete: {written} of {declared} bytes")]
    Incomplete {
        /// The object being received.
        name: ObjectName,
        /// Size announced on the first chunk.
        declared: u64,
        /// Bytes written so far.
        written: u64,
    },

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
