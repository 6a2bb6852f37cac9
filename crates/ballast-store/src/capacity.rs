//! Live byte counter for locally held objects.

use std::sync::atomic::{AtomicI64, Ordering};

/// Lock-free count of the bytes this node stores.
///
/// One counter exists per node context and is shared by `Arc`. Every
/// successful write, delete or receive-commit adjusts it; it is not
/// transactional with the filesystem, and the startup walk re-derives it.
#[derive(Debug, Default)]
pub struct CapacityCounter {
    bytes: AtomicI64,
}

impl CapacityCounter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` bytes.
    pub fn add(&self, n: u64) {
        self.bytes.fetch_add(n as i64, Ordering::Relaxed);
    }

    /// Subtract `n` bytes.
    pub fn sub(&self, n: u64) {
        self.bytes.fetch_sub(n as i64, Ordering::Relaxed);
    }

    /// Current value. May be transiently negative if deletes race a warm-up.
    pub fn get(&self) -> i64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Current value clamped at zero, as published to the cluster.
    pub fn bytes(&self) -> u64 {
        self.get().max(0) as u64
    }
}
