//! The coordination-store abstraction.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CoordError;

/// A change observed on a watched key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The key was written.
    Put {
        /// Key written.
        key: String,
        /// New value.
        value: String,
    },
    /// The key was deleted.
    Delete {
        /// Key removed.
        key: String,
    },
}

/// A live subscription to one key.
///
/// [`next`](Watch::next) returns `None` once the subscription has been
/// dropped by the server or the backend; callers that need liveness
/// re-issue the watch.
pub struct Watch {
    rx: mpsc::Receiver<WatchEvent>,
}

impl Watch {
    /// Wrap a receiving channel fed by a backend.
    pub fn new(rx: mpsc::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next event.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// Minimal KV + watch surface of the coordination store.
///
/// Implementations must be safe for concurrent use from many tasks.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError>;

    /// Read every key under `prefix` in one consistent read.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordError>;

    /// Write a key.
    async fn put(&self, key: &str, value: &str) -> Result<(), CoordError>;

    /// Write a key only if it does not exist. Returns whether it was created.
    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, CoordError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CoordError>;

    /// Subscribe to changes of exactly `key`.
    async fn watch(&self, key: &str) -> Result<Watch, CoordError>;
}
