//! The querying side of the locate protocol.

use std::sync::Arc;
use std::time::Duration;

use ballast_coord::{Coordinator, WatchEvent, keys};
use ballast_types::{LocateRequest, LocateResponse, ObjectName};
use rand::RngCore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::LocateError;

/// Broadcasts locate requests and waits for holders to answer.
#[derive(Clone)]
pub struct LocateClient {
    coord: Arc<dyn Coordinator>,
    group: String,
}

impl LocateClient {
    /// Create a client for `group`.
    pub fn new(coord: Arc<dyn Coordinator>, group: impl Into<String>) -> Self {
        Self {
            coord,
            group: group.into(),
        }
    }

    /// First holder to answer within `timeout`, if any.
    pub async fn locate(
        &self,
        object: &ObjectName,
        timeout: Duration,
    ) -> Result<Option<LocateResponse>, LocateError> {
        let answers = self.query(object, timeout, true).await?;
        Ok(answers.into_iter().next())
    }

    /// Every holder that answers within `timeout`.
    pub async fn locate_all(
        &self,
        object: &ObjectName,
        timeout: Duration,
    ) -> Result<Vec<LocateResponse>, LocateError> {
        self.query(object, timeout, false).await
    }

    async fn query(
        &self,
        object: &ObjectName,
        timeout: Duration,
        first_only: bool,
    ) -> Result<Vec<LocateResponse>, LocateError> {
        let reply_key = keys::locate_reply_key(&self.group, &reply_token());
        let mut watch = self.coord.watch(&reply_key).await?;

        let request = LocateRequest {
            object: object.clone(),
            reply_key: reply_key.clone(),
        };
        self.coord
            .put(&keys::locate_broadcast_key(&self.group), &request.encode())
            .await?;

        let deadline = Instant::now() + timeout;
        let mut answers = Vec::new();
        let mut closed = false;
        while let Ok(event) = tokio::time::timeout_at(deadline, watch.next()).await {
            let Some(event) = event else {
                closed = true;
                break;
            };
            let WatchEvent::Put { value, .. } = event else {
                continue;
            };
            match LocateResponse::parse(&value) {
                Ok(answer) => {
                    debug!(%object, address = %answer.address, "locate answer");
                    answers.push(answer);
                    if first_only {
                        break;
                    }
                }
                Err(e) => warn!(%object, value = %value, error = %e, "ignoring malformed locate answer"),
            }
        }

        if let Err(e) = self.coord.delete(&reply_key).await {
            warn!(%reply_key, error = %e, "failed to delete reply key");
        }
        if closed && answers.is_empty() {
            return Err(LocateError::ReplyClosed(reply_key));
        }
        Ok(answers)
    }
}

/// 16 random bytes as hex.
fn reply_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
