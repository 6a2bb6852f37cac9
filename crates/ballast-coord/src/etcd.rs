//! etcd-backed [`Coordinator`].

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, EventType, GetOptions, Txn, TxnOp};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::CoordError;
use crate::traits::{Coordinator, Watch, WatchEvent};

/// Buffered events per watch before the forwarder applies backpressure.
const WATCH_BUFFER: usize = 256;

/// [`Coordinator`] over an etcd v3 cluster.
///
/// The etcd client is cheap to clone and every call works on its own clone,
/// so the coordinator can be shared freely.
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
}

impl EtcdCoordinator {
    /// Connect to the given endpoints (`host:port`).
    pub async fn connect(endpoints: &[String]) -> Result<Self, CoordError> {
        let client = Client::connect(endpoints, None).await?;
        debug!(?endpoints, "connected to etcd");
        Ok(Self { client })
    }
}

fn decode(key: &str, raw: Result<&str, etcd_client::Error>) -> Result<String, CoordError> {
    raw.map(str::to_owned).map_err(|e| CoordError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let resp = self.client.clone().get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(decode(key, kv.value_str())?)),
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordError> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = decode(prefix, kv.key_str())?;
            let value = decode(&key, kv.value_str())?;
            out.push((key, value));
        }
        Ok(out)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), CoordError> {
        self.client.clone().put(key, value, None).await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, CoordError> {
        let txn = Txn::new()
            .when([Compare::version(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = self.client.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        self.client.clone().delete(key, None).await?;
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<Watch, CoordError> {
        let (mut watcher, mut stream) = self.client.clone().watch(key, None).await?;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let key = key.to_string();

        // Forward etcd events until the server ends the stream or the
        // subscriber goes away, then cancel the server-side watch.
        tokio::spawn(async move {
            loop {
                let resp = tokio::select! {
                    msg = stream.message() => msg,
                    _ = tx.closed() => break,
                };
                let resp = match resp {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        debug!(%key, "etcd watch stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(%key, error = %e, "etcd watch stream failed");
                        break;
                    }
                };
                if resp.canceled() {
                    warn!(%key, reason = resp.cancel_reason(), "etcd watch canceled by server");
                    break;
                }
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let Ok(event_key) = kv.key_str() else { continue };
                    let ev = match event.event_type() {
                        EventType::Put => match kv.value_str() {
                            Ok(value) => WatchEvent::Put {
                                key: event_key.to_string(),
                                value: value.to_string(),
                            },
                            Err(e) => {
                                warn!(key = event_key, error = %e, "non-utf8 watch value dropped");
                                continue;
                            }
                        },
                        EventType::Delete => WatchEvent::Delete {
                            key: event_key.to_string(),
                        },
                    };
                    if tx.send(ev).await.is_err() {
                        let _ = watcher.cancel().await;
                        return;
                    }
                }
            }
            let _ = watcher.cancel().await;
        });

        Ok(Watch::new(rx))
    }
}
