//! Coordination-store access for ballast nodes.
//!
//! Everything cluster-wide that is not object bytes goes through a
//! [`Coordinator`]: a small KV + watch surface implemented by
//! [`EtcdCoordinator`] in production and [`MemoryCoordinator`] in tests.
//!
//! On top of it sit:
//!
//! - [`CapacityTracker`]: persists this node's byte counter and reads the
//!   whole group's counters for rebalancing.
//! - [`PeerDirectory`]: node id → [`PeerInfo`](ballast_types::PeerInfo).
//! - [`ServiceDiscovery`]: addresses of external services such as the
//!   metadata replicas.

mod capacity;
mod discovery;
mod error;
mod etcd;
pub mod keys;
mod memory;
mod peers;
mod traits;

pub use capacity::{CapacityReporterConfig, CapacityTracker, ReporterHandle};
pub use discovery::ServiceDiscovery;
pub use error::CoordError;
pub use etcd::EtcdCoordinator;
pub use memory::MemoryCoordinator;
pub use peers::PeerDirectory;
pub use traits::{Coordinator, Watch, WatchEvent};
