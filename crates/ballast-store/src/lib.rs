//! Local blob storage for ballast nodes.
//!
//! - [`ObjectStore`]: a flat directory of `<hash>.<shardIndex>` blobs with
//!   atomic writes, a recursive walk, and receive handles used by migration.
//! - [`CapacityCounter`]: the node's live count of locally held bytes.
//! - [`ExistCache`]: a bounded LRU of object names known to be local.

mod capacity;
mod error;
mod exist_cache;
mod object_store;

pub use capacity::CapacityCounter;
pub use error::StoreError;
pub use exist_cache::ExistCache;
pub use object_store::{ObjectStore, PendingObject, ReceiveOpen, StoredObject, WarmUp};
