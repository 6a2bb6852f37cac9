//! Error types for transfer RPC.

/// Errors that can occur during network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to connect to a remote endpoint.
    #[error("connection error: {0}")]
    Connect(String),

    /// Failed to open a stream.
    #[error("stream open error: {0}")]
    StreamOpen(String),

    /// Reading or writing a stream failed.
    #[error("stream io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The peer answered with a message that does not fit the exchange.
    #[error("unexpected message: {0}")]
    Unexpected(String),

    /// A transfer address could not be parsed or resolved.
    #[error("invalid transfer address {addr:?}: {reason}")]
    InvalidAddress {
        /// The offending address.
        addr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The stream was closed before the exchange completed.
    #[error("stream closed")]
    StreamClosed,
}
