//! Migration Transfer Engine (sender side).
//!
//! `send_to` moves local objects to a set of targets, each with a byte
//! quota:
//!
//! 1. One transfer stream is opened per target up front; any dial failure
//!    aborts the run before a byte moves.
//! 2. The store is walked once. Each object is charged to the *current*
//!    target of a [`QuotaCursor`], which advances once that target's quota
//!    is met. Objects left over when every quota is full make the run fail
//!    with [`MigrateError::ServerDepleted`].
//! 3. Object handles are queued to their target's writer task. Each writer
//!    is the only task touching its stream: it reads the file one chunk at
//!    a time, waits for each ack, and deletes the local object only after
//!    the final ack succeeds. At most `read_concurrency` files are open
//!    across all writers, and each holds one chunk in memory.
//! 4. Per-object failures are logged and counted; the walk continues and
//!    the run ends [`MigrateError::Degraded`]. Every stream is finished.

use std::sync::Arc;

use ballast_net::{MigrationTransport, ObjectChunk, TransferStream};
use ballast_store::{ObjectStore, StoreError, StoredObject};
use tokio::io::AsyncReadExt;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::deviation::DeviationPlan;
use crate::error::MigrateError;

/// Tuning for [`MigrationSender`].
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Files open for reading at once, across all targets.
    pub read_concurrency: usize,
    /// Maximum payload bytes per chunk frame.
    pub chunk_size: usize,
    /// Object handles queued per target writer.
    pub queue_depth: usize,
}

impl SenderConfig {
    /// Create a config suitable for fast test execution.
    ///
    /// Small chunks so multi-chunk objects are exercised with tiny files.
    pub fn test_config() -> Self {
        Self {
            read_concurrency: 4,
            chunk_size: 8,
            queue_depth: 2,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            read_concurrency: 16,
            chunk_size: 2 * 1024 * 1024,
            queue_depth: 32,
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Objects delivered and removed locally.
    pub objects: usize,
    /// Bytes delivered.
    pub bytes: u64,
}

// ---------------------------------------------------------------------------
// Quota cursor
// ---------------------------------------------------------------------------

/// Assigns objects to targets in enumeration order, filling one target's
/// quota before moving to the next.
///
/// The order is whatever the caller's map yields; it is not stable across
/// runs. A target is never revisited once the cursor has moved past it.
#[derive(Debug)]
pub struct QuotaCursor {
    targets: Vec<(String, u64)>,
    assigned: Vec<u64>,
    current: usize,
}

impl QuotaCursor {
    /// Build a cursor over `(address, quota)` pairs. Zero quotas are dropped.
    pub fn new(targets: impl IntoIterator<Item = (String, u64)>) -> Self {
        let targets: Vec<_> = targets.into_iter().filter(|(_, q)| *q > 0).collect();
        Self {
            assigned: vec![0; targets.len()],
            targets,
            current: 0,
        }
    }

    /// Charge `size` bytes to the current target and return its index, or
    /// `None` if every quota is already met.
    pub fn assign(&mut self, size: u64) -> Option<usize> {
        let idx = self.current;
        let (_, quota) = self.targets.get(idx)?;
        self.assigned[idx] += size;
        if self.assigned[idx] >= *quota {
            self.current += 1;
        }
        Some(idx)
    }

    /// Whether every quota is met.
    pub fn is_exhausted(&self) -> bool {
        self.current >= self.targets.len()
    }

    /// Target addresses in assignment order.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|(addr, _)| addr.as_str())
    }

    /// Bytes charged to each target so far.
    pub fn assigned(&self) -> impl Iterator<Item = (&str, u64)> {
        self.targets
            .iter()
            .zip(&self.assigned)
            .map(|((addr, _), n)| (addr.as_str(), *n))
    }
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct WriterOutcome {
    sent: usize,
    bytes: u64,
    failed: usize,
}

/// Stream one object from disk as a run of acknowledged chunks.
///
/// Returns the bytes sent.
async fn send_object(
    stream: &mut dyn TransferStream,
    store: &ObjectStore,
    target: &str,
    object: &StoredObject,
    chunk_size: usize,
    origin: &str,
) -> Result<u64, MigrateError> {
    let (mut file, size) = store.open_read(object).await?;
    let file_name = object.name.to_string();
    let capacity = usize::try_from(size).unwrap_or(usize::MAX).clamp(1, chunk_size.max(1));
    let mut buf = vec![0u8; capacity];
    let mut sent = 0u64;

    // An empty object still needs one chunk to announce it.
    loop {
        let len = (size - sent).min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..len]).await.map_err(StoreError::Io)?;
        sent += len as u64;

        let ack = stream
            .send_chunk(ObjectChunk {
                file_name: file_name.clone(),
                data: buf[..len].to_vec(),
                size,
                origin: origin.to_string(),
            })
            .await?;
        if !ack.success {
            return Err(MigrateError::Rejected {
                peer: target.to_string(),
                message: ack.message,
            });
        }
        if sent >= size {
            return Ok(size);
        }
    }
}

/// Own `stream` for the whole run: drain the queue, then finish.
async fn run_writer(
    target: String,
    mut stream: Box<dyn TransferStream>,
    mut queue: mpsc::Receiver<StoredObject>,
    store: Arc<ObjectStore>,
    open_files: Arc<Semaphore>,
    chunk_size: usize,
    origin: String,
) -> WriterOutcome {
    let mut outcome = WriterOutcome::default();

    while let Some(object) = queue.recv().await {
        let Ok(_permit) = open_files.acquire().await else {
            outcome.failed += 1;
            continue;
        };
        match send_object(stream.as_mut(), &store, &target, &object, chunk_size, &origin).await {
            Ok(size) => {
                outcome.sent += 1;
                outcome.bytes += size;
                debug!(object = %object.name, %target, size, "object migrated");
                if let Err(e) = store.remove(&object).await {
                    error!(object = %object.name, error = %e, "migrated but local delete failed");
                }
            }
            Err(e) => {
                outcome.failed += 1;
                warn!(object = %object.name, %target, error = %e, "object migration failed");
            }
        }
    }

    match stream.finish().await {
        Ok(ack) if !ack.success => {
            warn!(%target, message = %ack.message, "receiver reported failure on close");
        }
        Ok(_) => {}
        Err(e) => warn!(%target, error = %e, "failed to close transfer stream"),
    }
    outcome
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Streams local objects to peers and removes them once acknowledged.
pub struct MigrationSender {
    store: Arc<ObjectStore>,
    transport: Arc<dyn MigrationTransport>,
    /// This node's data-plane address, carried in every chunk.
    origin: String,
    config: SenderConfig,
}

impl MigrationSender {
    /// Create a sender for the objects in `store`.
    pub fn new(
        store: Arc<ObjectStore>,
        transport: Arc<dyn MigrationTransport>,
        origin: impl Into<String>,
        config: SenderConfig,
    ) -> Self {
        Self {
            store,
            transport,
            origin: origin.into(),
            config,
        }
    }

    /// `SendTo(targets)`: drain every local object into the targets.
    ///
    /// Objects left over once every quota is met fail the run with
    /// [`MigrateError::ServerDepleted`]; the assigned ones still move.
    #[tracing::instrument(skip(self, targets), fields(targets = targets.len()))]
    pub async fn send_to(&self, targets: DeviationPlan) -> Result<SendReport, MigrateError> {
        self.run(targets, true).await
    }

    /// Move objects until every quota is met, then stop.
    ///
    /// Serves `RequireSend`, where the node keeps whatever exceeds the
    /// requested volume.
    #[tracing::instrument(skip(self, targets), fields(targets = targets.len()))]
    pub async fn send_quota(&self, targets: DeviationPlan) -> Result<SendReport, MigrateError> {
        self.run(targets, false).await
    }

    async fn run(&self, targets: DeviationPlan, drain: bool) -> Result<SendReport, MigrateError> {
        let mut cursor = QuotaCursor::new(targets);
        if cursor.is_exhausted() {
            return Err(MigrateError::NoPeersAvailable);
        }

        // Dial every target before touching the store.
        let mut streams = Vec::new();
        for addr in cursor.addresses() {
            streams.push((addr.to_string(), self.transport.open_stream(addr).await?));
        }

        let open_files = Arc::new(Semaphore::new(self.config.read_concurrency.max(1)));
        let mut queues = Vec::with_capacity(streams.len());
        let mut writers = Vec::with_capacity(streams.len());
        for (addr, stream) in streams {
            let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
            queues.push(tx);
            writers.push(tokio::spawn(run_writer(
                addr,
                stream,
                rx,
                self.store.clone(),
                open_files.clone(),
                self.config.chunk_size,
                self.origin.clone(),
            )));
        }

        let objects = match self.store.walk().await {
            Ok(objects) => objects,
            Err(e) => {
                drop(queues);
                for writer in writers {
                    let _ = writer.await;
                }
                return Err(e.into());
            }
        };

        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut unsent_objects = 0usize;
        let mut unsent_bytes = 0u64;

        let mut remaining = objects.into_iter();
        while let Some(object) = remaining.next() {
            let Some(idx) = cursor.assign(object.size) else {
                unsent_objects = 1 + remaining.len();
                unsent_bytes = object.size + remaining.map(|o| o.size).sum::<u64>();
                break;
            };
            attempted += 1;
            if let Err(mpsc::error::SendError(object)) = queues[idx].send(object).await {
                warn!(object = %object.name, "transfer writer exited early");
                failed += 1;
            }
        }

        // Closing the queues lets each writer drain and finish its stream.
        drop(queues);
        let mut report = SendReport::default();
        for writer in writers {
            match writer.await {
                Ok(outcome) => {
                    report.objects += outcome.sent;
                    report.bytes += outcome.bytes;
                    failed += outcome.failed;
                }
                Err(e) => {
                    error!(error = %e, "writer task panicked");
                    failed += 1;
                }
            }
        }

        for (addr, bytes) in cursor.assigned() {
            debug!(target = addr, bytes, "bytes assigned to target");
        }
        info!(
            objects = report.objects,
            bytes = report.bytes,
            failed,
            unsent_objects,
            "migration run finished"
        );

        if drain && unsent_objects > 0 {
            return Err(MigrateError::ServerDepleted { unsent_bytes });
        }
        if failed > 0 {
            return Err(MigrateError::Degraded {
                failed,
                total: attempted,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_fills_in_order() {
        let mut c = QuotaCursor::new([("a".to_string(), 10), ("b".to_string(), 5)]);
        assert_eq!(c.assign(4), Some(0));
        assert_eq!(c.assign(4), Some(0));
        // Meets a's quota: next assignment moves on.
        assert_eq!(c.assign(4), Some(0));
        assert_eq!(c.assign(6), Some(1));
        assert!(c.is_exhausted());
        assert_eq!(c.assign(1), None);
        let assigned: Vec<_> = c.assigned().collect();
        assert_eq!(assigned, vec![("a", 12), ("b", 6)]);
    }

    #[test]
    fn test_cursor_drops_zero_quotas() {
        let mut c = QuotaCursor::new([("a".to_string(), 0), ("b".to_string(), 1)]);
        assert_eq!(c.addresses().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(c.assign(100), Some(0));
        assert!(c.is_exhausted());

        let c = QuotaCursor::new(Vec::<(String, u64)>::new());
        assert!(c.is_exhausted());
    }

    #[test]
    fn test_cursor_never_revisits() {
        let mut c = QuotaCursor::new([("a".to_string(), 1), ("b".to_string(), 100)]);
        assert_eq!(c.assign(5), Some(0));
        for _ in 0..10 {
            assert_eq!(c.assign(1), Some(1));
        }
    }
}
