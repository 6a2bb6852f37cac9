//! Migration Receiver.
//!
//! One [`ReceiveSession`] serves one inbound `ReceiveData` stream, which may
//! carry many objects back to back. Per object:
//!
//! - The first chunk's name and size open a temp file. If the object is
//!   already stored with that size, the delivery is a duplicate: its chunks
//!   are consumed without writing, and the last one reconciles metadata
//!   exactly as a fresh commit would.
//! - Later chunks are appended and acknowledged one at a time.
//! - When the written bytes reach the declared size the object is committed
//!   (renamed into place, capacity counted) and its metadata reconciled.
//!   The last chunk's ack reports whether reconciliation held.
//! - A write failure aborts the temp file; the remaining chunks of that
//!   object are refused.

use std::sync::Arc;

use ballast_net::{Ack, ChunkSink, ObjectChunk, ObjectDescriptor};
use ballast_store::{ObjectStore, PendingObject, ReceiveOpen};
use ballast_types::ObjectName;
use tracing::{debug, info, warn};

use crate::backlog::ReconcileBacklog;
use crate::error::MigrateError;
use crate::reconcile::Reconciler;

/// Server-side receive logic shared by all sessions of a node.
#[derive(Clone)]
pub struct Receiver {
    store: Arc<ObjectStore>,
    reconciler: Arc<Reconciler>,
    backlog: Arc<ReconcileBacklog>,
}

impl Receiver {
    /// Create a receiver writing into `store`.
    pub fn new(
        store: Arc<ObjectStore>,
        reconciler: Arc<Reconciler>,
        backlog: Arc<ReconcileBacklog>,
    ) -> Self {
        Self {
            store,
            reconciler,
            backlog,
        }
    }

    /// Start a session for one inbound stream.
    pub fn session(&self) -> ReceiveSession {
        ReceiveSession {
            receiver: self.clone(),
            state: State::AwaitingFirstChunk,
        }
    }

    /// `FinishReceive(objectDescriptor)`: the object must already be stored
    /// here; its metadata is reconciled again.
    ///
    /// Capacity was counted at commit, so it is not touched.
    pub async fn finish_receive(&self, object: &ObjectDescriptor) -> Result<(), MigrateError> {
        let name: ObjectName = object.file_name.parse()?;
        if !self.store.exists(&name).await? {
            return Err(MigrateError::ObjectMissing(object.file_name.clone()));
        }
        self.settle(&object.file_name, &object.origin).await
    }

    /// Reconcile, queueing the object for retry if metadata could not be
    /// brought up to date.
    async fn settle(&self, file_name: &str, origin: &str) -> Result<(), MigrateError> {
        match self.reconciler.reconcile(file_name, origin).await {
            Ok(_) => Ok(()),
            Err(e @ (MigrateError::ObjectMissing(_) | MigrateError::InvalidName(_))) => Err(e),
            Err(e) => {
                warn!(%file_name, %origin, error = %e, "reconciliation deferred to backlog");
                self.backlog.push(file_name, origin);
                Err(e)
            }
        }
    }
}

enum State {
    /// Between objects.
    AwaitingFirstChunk,
    /// Writing an object.
    Receiving {
        pending: PendingObject,
        origin: String,
    },
    /// Consuming the rest of an object without writing it.
    Draining {
        file_name: String,
        remaining: u64,
        /// For a duplicate, the origin to reconcile against once the last
        /// chunk arrives. `None` for a rejected object.
        duplicate_of: Option<String>,
    },
}

/// State machine for one `ReceiveData` stream.
pub struct ReceiveSession {
    receiver: Receiver,
    state: State,
}

impl ReceiveSession {
    fn drain(&mut self, file_name: &str, remaining: u64, duplicate_of: Option<String>) {
        if remaining > 0 {
            self.state = State::Draining {
                file_name: file_name.to_string(),
                remaining,
                duplicate_of,
            };
        }
    }

    /// Ack a chunk of a duplicate; the last one reconciles.
    async fn duplicate_chunk(&mut self, file_name: &str, remaining: u64, origin: String) -> Ack {
        if remaining > 0 {
            self.drain(file_name, remaining, Some(origin));
            return Ack::ok();
        }
        match self.receiver.settle(file_name, &origin).await {
            Ok(()) => Ack::ok(),
            Err(e) => Ack::fail(e.to_string()),
        }
    }

    async fn start(&mut self, chunk: ObjectChunk) -> Ack {
        let rest = chunk.size.saturating_sub(chunk.data.len() as u64);
        let name: ObjectName = match chunk.file_name.parse() {
            Ok(name) => name,
            Err(e) => {
                warn!(file_name = %chunk.file_name, "rejecting object with invalid name");
                self.drain(&chunk.file_name, rest, None);
                return Ack::fail(MigrateError::from(e).to_string());
            }
        };

        match self.receiver.store.open_receive(&name, chunk.size).await {
            Ok(ReceiveOpen::AlreadyPresent) => {
                debug!(%name, "duplicate delivery, already stored");
                self.duplicate_chunk(&chunk.file_name, rest, chunk.origin)
                    .await
            }
            Ok(ReceiveOpen::Open(pending)) => {
                let origin = chunk.origin.clone();
                self.append(pending, origin, chunk).await
            }
            Err(e) => {
                warn!(%name, error = %e, "cannot open object for receive");
                self.drain(&chunk.file_name, rest, None);
                Ack::fail(e.to_string())
            }
        }
    }

    async fn append(&mut self, mut pending: PendingObject, origin: String, chunk: ObjectChunk) -> Ack {
        if let Err(e) = pending.write_chunk(&chunk.data).await {
            let rest = pending
                .declared()
                .saturating_sub(pending.written() + chunk.data.len() as u64);
            warn!(name = %pending.name(), error = %e, "receive write failed, aborting object");
            pending.abort().await;
            self.drain(&chunk.file_name, rest, None);
            return Ack::fail(e.to_string());
        }

        if !pending.is_complete() {
            self.state = State::Receiving { pending, origin };
            return Ack::ok();
        }

        let name = pending.name().clone();
        let size = match self.receiver.store.commit(pending).await {
            Ok(size) => size,
            Err(e) => {
                warn!(%name, error = %e, "commit of received object failed");
                return Ack::fail(e.to_string());
            }
        };
        info!(%name, size, %origin, "object received");

        match self.receiver.settle(&chunk.file_name, &origin).await {
            Ok(()) => Ack::ok(),
            Err(e) => Ack::fail(e.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl ChunkSink for ReceiveSession {
    async fn chunk(&mut self, chunk: ObjectChunk) -> Ack {
        match std::mem::replace(&mut self.state, State::AwaitingFirstChunk) {
            State::Draining {
                file_name,
                remaining,
                duplicate_of,
            } if file_name == chunk.file_name => {
                let remaining = remaining.saturating_sub(chunk.data.len() as u64);
                match duplicate_of {
                    Some(origin) => self.duplicate_chunk(&file_name, remaining, origin).await,
                    None => {
                        self.drain(&file_name, remaining, None);
                        Ack::fail(format!("object {file_name} was rejected"))
                    }
                }
            }
            State::Receiving { pending, origin } if pending.name().to_string() == chunk.file_name => {
                self.append(pending, origin, chunk).await
            }
            State::Receiving { pending, .. } => {
                warn!(
                    name = %pending.name(),
                    written = pending.written(),
                    declared = pending.declared(),
                    "object interrupted by the next one, discarding"
                );
                pending.abort().await;
                self.start(chunk).await
            }
            State::Draining { .. } | State::AwaitingFirstChunk => self.start(chunk).await,
        }
    }

    async fn end(self: Box<Self>) -> Ack {
        match self.state {
            State::Receiving { pending, .. } => {
                let name = pending.name().clone();
                warn!(%name, written = pending.written(), declared = pending.declared(), "stream ended mid-object");
                pending.abort().await;
                Ack::fail(format!("stream ended before {name} was complete"))
            }
            State::Draining { .. } | State::AwaitingFirstChunk => Ack::ok(),
        }
    }

    async fn abort(self: Box<Self>, reason: String) {
        if let State::Receiving { pending, .. } = self.state {
            warn!(name = %pending.name(), %reason, "receive stream broke, discarding partial object");
            pending.abort().await;
        }
    }
}
