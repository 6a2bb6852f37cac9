//! In-process [`Coordinator`] for tests and single-node runs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::CoordError;
use crate::traits::{Coordinator, Watch, WatchEvent};

const WATCH_BUFFER: usize = 256;

/// A [`Coordinator`] holding everything in a `BTreeMap`.
///
/// Watches receive events for puts and deletes of their exact key.
/// [`drop_watchers`](Self::drop_watchers) simulates the server cancelling
/// every subscription.
#[derive(Default)]
pub struct MemoryCoordinator {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    kv: BTreeMap<String, String>,
    watchers: Vec<(String, mpsc::Sender<WatchEvent>)>,
}

impl MemoryCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close every open watch, as if the server had cancelled them.
    pub fn drop_watchers(&self) {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        let dropped = inner.watchers.len();
        inner.watchers.clear();
        debug!(dropped, "dropped all watchers");
    }

    /// Number of live watches on `key`.
    pub fn watcher_count(&self, key: &str) -> usize {
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        inner.watchers.retain(|(_, tx)| !tx.is_closed());
        inner.watchers.iter().filter(|(k, _)| k == key).count()
    }

    /// Collect senders subscribed to `key`, pruning closed ones.
    fn subscribers(inner: &mut Inner, key: &str) -> Vec<mpsc::Sender<WatchEvent>> {
        inner.watchers.retain(|(_, tx)| !tx.is_closed());
        inner
            .watchers
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    async fn notify(subscribers: Vec<mpsc::Sender<WatchEvent>>, event: WatchEvent) {
        for tx in subscribers {
            let _ = tx.send(event.clone()).await;
        }
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let inner = self.inner.lock().expect("coordinator lock poisoned");
        Ok(inner.kv.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordError> {
        let inner = self.inner.lock().expect("coordinator lock poisoned");
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), CoordError> {
        let subscribers = {
            let mut inner = self.inner.lock().expect("coordinator lock poisoned");
            inner.kv.insert(key.to_string(), value.to_string());
            Self::subscribers(&mut inner, key)
        };
        let event = WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
        };
        Self::notify(subscribers, event).await;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, CoordError> {
        let subscribers = {
            let mut inner = self.inner.lock().expect("coordinator lock poisoned");
            if inner.kv.contains_key(key) {
                return Ok(false);
            }
            inner.kv.insert(key.to_string(), value.to_string());
            Self::subscribers(&mut inner, key)
        };
        let event = WatchEvent::Put {
            key: key.to_string(),
            value: value.to_string(),
        };
        Self::notify(subscribers, event).await;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        let subscribers = {
            let mut inner = self.inner.lock().expect("coordinator lock poisoned");
            if inner.kv.remove(key).is_none() {
                return Ok(());
            }
            Self::subscribers(&mut inner, key)
        };
        let event = WatchEvent::Delete {
            key: key.to_string(),
        };
        Self::notify(subscribers, event).await;
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<Watch, CoordError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut inner = self.inner.lock().expect("coordinator lock poisoned");
        inner.watchers.push((key.to_string(), tx));
        Ok(Watch::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let c = MemoryCoordinator::new();
        c.put("a", "1").await.unwrap();
        assert_eq!(c.get("a").await.unwrap().as_deref(), Some("1"));
        c.delete("a").await.unwrap();
        assert_eq!(c.get("a").await.unwrap(), None);
        // Deleting again is fine.
        c.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_prefix_is_bounded() {
        let c = MemoryCoordinator::new();
        c.put("capacity/g/a", "1").await.unwrap();
        c.put("capacity/g/b", "2").await.unwrap();
        c.put("capacity/h/c", "3").await.unwrap();
        c.put("peers/g/a", "{}").await.unwrap();

        let got = c.get_prefix("capacity/g/").await.unwrap();
        assert_eq!(
            got,
            vec![
                ("capacity/g/a".to_string(), "1".to_string()),
                ("capacity/g/b".to_string(), "2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let c = MemoryCoordinator::new();
        assert!(c.put_if_absent("k", "").await.unwrap());
        assert!(!c.put_if_absent("k", "other").await.unwrap());
        assert_eq!(c.get("k").await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_watch_sees_puts_and_deletes_of_its_key_only() {
        let c = MemoryCoordinator::new();
        let mut w = c.watch("k").await.unwrap();
        c.put("other", "x").await.unwrap();
        c.put("k", "v1").await.unwrap();
        c.delete("k").await.unwrap();

        assert_eq!(
            w.next().await,
            Some(WatchEvent::Put {
                key: "k".into(),
                value: "v1".into()
            })
        );
        assert_eq!(w.next().await, Some(WatchEvent::Delete { key: "k".into() }));
    }

    #[tokio::test]
    async fn test_drop_watchers_closes_streams() {
        let c = MemoryCoordinator::new();
        let mut w = c.watch("k").await.unwrap();
        assert_eq!(c.watcher_count("k"), 1);
        c.drop_watchers();
        assert_eq!(w.next().await, None);
        assert_eq!(c.watcher_count("k"), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let c = MemoryCoordinator::new();
        let w = c.watch("k").await.unwrap();
        drop(w);
        c.put("k", "v").await.unwrap();
        assert_eq!(c.watcher_count("k"), 0);
    }
}
