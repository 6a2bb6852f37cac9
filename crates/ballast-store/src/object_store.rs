//! File-based object store.
//!
//! Objects live as flat files named `<hash>.<shardIndex>` under the storage
//! directory. Every write lands in the temp directory first and is renamed
//! into place, so a half-written blob is never visible under its final name.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ballast_types::ObjectName;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::capacity::CapacityCounter;
use crate::error::StoreError;
use crate::exist_cache::ExistCache;

const TMP_EXT: &str = "tmp";

/// A blob found by [`ObjectStore::walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Parsed object name.
    pub name: ObjectName,
    /// Absolute path of the blob.
    pub path: PathBuf,
    /// Size on disk in bytes.
    pub size: u64,
}

/// Outcome of the startup warm-up walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmUp {
    /// Objects found.
    pub objects: usize,
    /// Bytes added to the capacity counter.
    pub bytes: u64,
    /// Leftover temp files removed from earlier runs.
    pub stale_temps: usize,
}

/// Result of opening an object for receipt.
#[derive(Debug)]
pub enum ReceiveOpen {
    /// The object is already stored with the declared size; nothing to write.
    AlreadyPresent,
    /// A fresh temp file is open for the incoming bytes.
    Open(PendingObject),
}

/// An object being received chunk by chunk.
///
/// Bytes go to a temp file; [`ObjectStore::commit`] renames it into place
/// once `written == declared`. Dropping without committing leaves the temp
/// file behind; call [`PendingObject::abort`] to remove it.
#[derive(Debug)]
pub struct PendingObject {
    name: ObjectName,
    declared: u64,
    written: u64,
    tmp_path: PathBuf,
    file: tokio::fs::File,
}

impl PendingObject {
    /// The object being received.
    pub fn name(&self) -> &ObjectName {
        &self.name
    }

    /// Size announced by the sender.
    pub fn declared(&self) -> u64 {
        self.declared
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Whether every declared byte has been written.
    pub fn is_complete(&self) -> bool {
        self.written == self.declared
    }

    /// Append a chunk.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), StoreError> {
        let received = self.written + data.len() as u64;
        if received > self.declared {
            return Err(StoreError::Overflow {
                name: self.name.clone(),
                declared: self.declared,
                received,
            });
        }
        self.file.write_all(data).await?;
        self.written = received;
        Ok(())
    }

    /// Discard the partial object.
    pub async fn abort(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.tmp_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(name = %self.name, error = %e, "failed to remove aborted receive");
        }
    }
}

/// Flat-directory blob store that keeps the node's capacity counter and
/// existence cache in step with its mutations.
pub struct ObjectStore {
    dir: PathBuf,
    temp_dir: PathBuf,
    counter: Arc<CapacityCounter>,
    cache: ExistCache,
    tmp_seq: AtomicU64,
}

impl ObjectStore {
    /// Open a store rooted at `dir`, staging writes in `temp_dir`.
    ///
    /// Both directories are created if missing. `temp_dir` must be on the
    /// same filesystem as `dir` so commits are a rename.
    pub fn open(
        dir: impl AsRef<Path>,
        temp_dir: impl AsRef<Path>,
        counter: Arc<CapacityCounter>,
        cache_entries: usize,
    ) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let temp_dir = temp_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            dir,
            temp_dir,
            counter,
            cache: ExistCache::new(cache_entries),
            tmp_seq: AtomicU64::new(0),
        })
    }

    /// Root directory of stored objects.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The capacity counter this store mutates.
    pub fn counter(&self) -> &Arc<CapacityCounter> {
        &self.counter
    }

    fn object_path(&self, name: &ObjectName) -> PathBuf {
        self.dir.join(name.to_string())
    }

    fn next_tmp_path(&self, name: &ObjectName) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        self.temp_dir.join(format!("{name}.{seq}.{TMP_EXT}"))
    }

    fn receive_tmp_path(&self, name: &ObjectName) -> PathBuf {
        self.temp_dir.join(format!("{name}.recv.{TMP_EXT}"))
    }

    /// Size of the stored object, or `None` if it is not on disk.
    async fn stored_size(&self, name: &ObjectName) -> Result<Option<u64>, StoreError> {
        match tokio::fs::metadata(self.object_path(name)).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Remove leftover temp files, then walk the store once, summing sizes
    /// into the capacity counter and marking every object in the cache.
    pub async fn warm_up(&self) -> Result<WarmUp, StoreError> {
        let mut report = WarmUp::default();

        let mut entries = tokio::fs::read_dir(&self.temp_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && is_tmp(&path) {
                tokio::fs::remove_file(&path).await?;
                report.stale_temps += 1;
            }
        }

        for obj in self.walk().await? {
            self.counter.add(obj.size);
            self.cache.insert(&obj.name);
            report.objects += 1;
            report.bytes += obj.size;
        }

        info!(
            objects = report.objects,
            bytes = report.bytes,
            stale_temps = report.stale_temps,
            "object store warmed up"
        );
        Ok(report)
    }

    /// Recursively list stored objects.
    ///
    /// Directories are descended but not returned; temp files, the temp
    /// directory and names that are not `<hash>.<shardIndex>` are skipped.
    pub async fn walk(&self) -> Result<Vec<StoredObject>, StoreError> {
        let mut objects = Vec::new();
        let mut pending = vec![self.dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if path != self.temp_dir {
                        pending.push(path);
                    }
                    continue;
                }
                if !file_type.is_file() || is_tmp(&path) {
                    continue;
                }
                let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                let name = match file_name.parse::<ObjectName>() {
                    Ok(name) => name,
                    Err(_) => {
                        debug!(file = %path.display(), "skipping non-object file");
                        continue;
                    }
                };
                let size = entry.metadata().await?.len();
                objects.push(StoredObject { name, path, size });
            }
        }
        Ok(objects)
    }

    /// Store a whole object atomically.
    pub async fn put(&self, name: &ObjectName, data: Bytes) -> Result<(), StoreError> {
        let previous = self.stored_size(name).await?;
        let tmp_path = self.next_tmp_path(name);
        let path = self.object_path(name);

        tokio::fs::write(&tmp_path, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(e));
        }

        if let Some(old) = previous {
            self.counter.sub(old);
        }
        self.counter.add(data.len() as u64);
        self.cache.insert(name);
        debug!(%name, size = data.len(), "stored object");
        Ok(())
    }

    /// Read a whole object.
    pub async fn get(&self, name: &ObjectName) -> Result<Option<Bytes>, StoreError> {
        match tokio::fs::read(self.object_path(name)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Open a blob found by [`walk`](Self::walk) for streaming reads.
    ///
    /// Returns the file and its size at open time, which may differ from
    /// the size recorded by the walk.
    pub async fn open_read(&self, obj: &StoredObject) -> Result<(tokio::fs::File, u64), StoreError> {
        let file = match tokio::fs::File::open(&obj.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(obj.name.clone()));
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Delete an object. Returns the freed size, or `None` if it was absent.
    pub async fn delete(&self, name: &ObjectName) -> Result<Option<u64>, StoreError> {
        self.remove_path(name, &self.object_path(name)).await
    }

    /// Delete a blob found by [`walk`](Self::walk).
    pub async fn remove(&self, obj: &StoredObject) -> Result<Option<u64>, StoreError> {
        self.remove_path(&obj.name, &obj.path).await
    }

    async fn remove_path(&self, name: &ObjectName, path: &Path) -> Result<Option<u64>, StoreError> {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.cache.remove(name);
                return Ok(None);
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.cache.remove(name);
                return Ok(None);
            }
            Err(e) => return Err(StoreError::Io(e)),
        }
        self.counter.sub(size);
        self.cache.remove(name);
        debug!(%name, size, "deleted object");
        Ok(Some(size))
    }

    /// Whether the object is stored locally.
    ///
    /// The existence cache answers first; on a miss the filesystem is probed
    /// and a hit re-populates the cache.
    pub async fn exists(&self, name: &ObjectName) -> Result<bool, StoreError> {
        if self.cache.contains(name) {
            return Ok(true);
        }
        let found = self.stored_size(name).await?.is_some();
        if found {
            self.cache.insert(name);
        }
        Ok(found)
    }

    /// Prepare to receive an object of `size` bytes.
    ///
    /// If it is already stored with that size the receive is a duplicate
    /// delivery and [`ReceiveOpen::AlreadyPresent`] is returned. A stored
    /// copy with a different size is a stale leftover and is removed first.
    pub async fn open_receive(
        &self,
        name: &ObjectName,
        size: u64,
    ) -> Result<ReceiveOpen, StoreError> {
        match self.stored_size(name).await? {
            Some(existing) if existing == size => {
                self.cache.insert(name);
                return Ok(ReceiveOpen::AlreadyPresent);
            }
            Some(existing) => {
                warn!(%name, existing, declared = size, "replacing stale object before receive");
                self.delete(name).await?;
            }
            None => {}
        }

        let tmp_path = self.receive_tmp_path(name);
        let file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::ReceiveInProgress(name.clone()));
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        Ok(ReceiveOpen::Open(PendingObject {
            name: name.clone(),
            declared: size,
            written: 0,
            tmp_path,
            file,
        }))
    }

    /// Sync the temp file and rename it over the final path. Returns the
    /// size of the copy it replaced.
    async fn install(&self, pending: &mut PendingObject) -> Result<Option<u64>, StoreError> {
        pending.file.flush().await?;
        pending.file.sync_all().await?;
        let previous = self.stored_size(&pending.name).await?;
        tokio::fs::rename(&pending.tmp_path, self.object_path(&pending.name)).await?;
        Ok(previous)
    }

    /// Make a fully received object visible and count its bytes.
    ///
    /// Returns the committed size.
    pub async fn commit(&self, mut pending: PendingObject) -> Result<u64, StoreError> {
        if !pending.is_complete() {
            let err = StoreError::Incomplete {
                name: pending.name.clone(),
                declared: pending.declared,
                written: pending.written,
            };
            pending.abort().await;
            return Err(err);
        }

        let previous = match self.install(&mut pending).await {
            Ok(previous) => previous,
            Err(e) => {
                pending.abort().await;
                return Err(e);
            }
        };
        let PendingObject { name, declared, .. } = pending;

        if let Some(old) = previous {
            self.counter.sub(old);
        }
        self.counter.add(declared);
        self.cache.insert(&name);
        debug!(%name, size = declared, "committed received object");
        Ok(declared)
    }
}

fn is_tmp(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == TMP_EXT)
}
