//! Capacity-aware rebalancing for ballast nodes.
//!
//! When a node joins or leaves, [`DeviationCalculator`] works out how many
//! bytes must move to or from each peer, [`MigrationSender`] streams local
//! objects to the chosen peers, and [`Receiver`] writes them on the other
//! side and repoints the external metadata at their new holder through
//! [`Reconciler`]. [`MigrationService`] ties the pieces together behind the
//! node's RPC surface.

mod backlog;
mod deviation;
mod error;
mod metadata;
mod receiver;
mod reconcile;
mod sender;
mod service;

pub use backlog::{BacklogHandle, ReconcileBacklog};
pub use deviation::{DeviationCalculator, DeviationPlan, compute_deltas};
pub use error::{MetadataError, MigrateError};
pub use metadata::{HttpMetadataService, MetadataService};
pub use receiver::{ReceiveSession, Receiver};
pub use reconcile::{ReconcileReport, Reconciler, too_many_failures};
pub use sender::{MigrationSender, QuotaCursor, SendReport, SenderConfig};
pub use service::MigrationService;
