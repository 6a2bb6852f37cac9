//! Cluster-wide "who holds this blob" queries without a central directory.
//!
//! Every node watches one shared broadcast key. A query is written there as
//! `<hash>.<shardIndex>#<replyKey>`; each node that holds the blob answers
//! by writing `<address>#<shardIndex>` to the reply key. Nodes that do not
//! hold it stay silent.
//!
//! - [`start_locate`]: the responder loop every node runs.
//! - [`LocateClient`]: issues queries and collects answers.

mod client;
mod error;
mod locator;

pub use client::LocateClient;
pub use error::LocateError;
pub use locator::{LocatorConfig, LocatorHandle, start_locate};
