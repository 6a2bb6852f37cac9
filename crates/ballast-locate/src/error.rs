//! Error types for the locate protocol.

/// Errors that can occur while answering or issuing locate requests.
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    /// Coordination-store failure.
    #[error("coordination error: {0}")]
    Coord(#[from] ballast_coord::CoordError),

    /// The reply watch closed before the deadline.
    #[error("reply watch on {0} closed")]
    ReplyClosed(String),
}
