//! Bounded LRU set of object names known to be stored locally.
//!
//! The locate responder consults this before touching the filesystem.
//! A miss is not authoritative: callers fall back to a probe and
//! re-insert on a hit.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use ballast_types::ObjectName;
use tracing::trace;

/// Thread-safe LRU of object names.
///
/// All operations take a single lock; the critical section is pure
/// in-memory work with no I/O.
///
/// Promotion does not search the access queue. Each touch stamps the name
/// with a fresh generation and appends it; queue entries whose stamp no
/// longer matches are skipped on eviction and swept out once the queue
/// grows past twice the capacity. Every operation is amortized O(1).
pub struct ExistCache {
    max_entries: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    /// Access order: front = oldest, back = newest. May hold stale stamps.
    order: VecDeque<(ObjectName, u64)>,
    /// Live names and the generation of their latest touch.
    members: HashMap<ObjectName, u64>,
    next_gen: u64,
}

impl CacheInner {
    fn touch(&mut self, name: &ObjectName, max_entries: usize) {
        let generation = self.next_gen;
        self.next_gen += 1;
        self.members.insert(name.clone(), generation);
        self.order.push_back((name.clone(), generation));
        if self.order.len() > max_entries.saturating_mul(2) {
            let members = &self.members;
            self.order.retain(|(n, g)| members.get(n) == Some(g));
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((name, generation)) = self.order.pop_front() {
            if self.members.get(&name) == Some(&generation) {
                self.members.remove(&name);
                trace!(evicted = %name, "evicted exist-cache entry");
                return true;
            }
        }
        false
    }
}

impl ExistCache {
    /// Create a cache holding at most `max_entries` names.
    ///
    /// A capacity of 0 disables caching; every lookup misses.
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            inner: Mutex::new(CacheInner {
                order: VecDeque::new(),
                members: HashMap::new(),
                next_gen: 0,
            }),
        }
    }

    /// Mark a name as present, evicting the oldest entry if full.
    pub fn insert(&self, name: &ObjectName) {
        if self.max_entries == 0 {
            return;
        }
        let mut inner = self.inner.lock().expect("exist cache lock poisoned");
        if !inner.members.contains_key(name) {
            while inner.members.len() >= self.max_entries {
                if !inner.evict_oldest() {
                    break;
                }
            }
        }
        inner.touch(name, self.max_entries);
    }

    /// Whether the name is cached as present. Promotes on hit.
    pub fn contains(&self, name: &ObjectName) -> bool {
        let mut inner = self.inner.lock().expect("exist cache lock poisoned");
        if !inner.members.contains_key(name) {
            return false;
        }
        inner.touch(name, self.max_entries);
        true
    }

    /// Forget a name (after a delete or migration away).
    ///
    /// Its queue entry goes stale and is dropped later.
    pub fn remove(&self, name: &ObjectName) {
        let mut inner = self.inner.lock().expect("exist cache lock poisoned");
        inner.members.remove(name);
    }

    /// Current number of cached names.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("exist cache lock poisoned").members.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
