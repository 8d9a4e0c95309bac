//! Local document storage with per-identifier locking.
//!
//! Writes and deletes for one identifier are serialized through a lock table.
//! A save streams into a hidden temporary sibling and is renamed into place
//! only once every byte is on disk, so readers never observe a partial file.
//! Reads (`exists`, `size`, `hash`, `read`) take no lock and return whatever
//! is on disk at that moment.

use crate::config::{HASH_BLOCK_SIZE, MAX_IDENTIFIER_LEN, MAX_UPLOAD_BYTES, WRITE_CHUNK_SIZE};
use crate::error::{GatewayError, GatewayResult};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Location and size of a durably written file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Identifier -> mutex map. Entries are created on demand and removed by
/// `cleanup` once nobody holds or waits on them.
#[derive(Default)]
pub struct LockTable {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        // Clone out of the shard before awaiting; a DashMap guard must not cross an await.
        let lock = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drops uncontended entries and returns how many were removed.
    ///
    /// Holders and waiters keep their own `Arc`, so a strong count of one
    /// means only the table references the lock.
    pub fn cleanup(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct FileStore {
    root: PathBuf,
    locks: LockTable,
    max_file_size: u64,
}

impl FileStore {
    pub async fn new(root: impl AsRef<Path>) -> GatewayResult<Self> {
        Self::with_max_file_size(root, MAX_UPLOAD_BYTES).await
    }

    pub async fn with_max_file_size(root: impl AsRef<Path>, max_file_size: u64) -> GatewayResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            locks: LockTable::new(),
            max_file_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    fn file_path(&self, id: &str) -> GatewayResult<PathBuf> {
        validate_identifier(id)?;
        Ok(self.root.join(id))
    }

    /// Stream `body` into the file for `id`.
    ///
    /// Fails with `AlreadyExists` if the file is present. On any failure the
    /// temporary file is removed before the error is returned.
    pub async fn save<S, E>(&self, id: &str, body: S) -> GatewayResult<SavedFile>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let path = self.file_path(id)?;
        let _guard = self.locks.acquire(id).await;

        if fs::try_exists(&path).await? {
            return Err(GatewayError::AlreadyExists(format!("file {} already exists", id)));
        }

        let temp_path = self.root.join(format!(".{}.{}.tmp", id, Uuid::new_v4().simple()));
        let written = self.write_temp(&temp_path, body).await;

        let result = match written {
            Ok(size) => fs::rename(&temp_path, &path)
                .await
                .map(|_| size)
                .map_err(GatewayError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(size) => {
                debug!("Saved {} ({} bytes)", id, size);
                Ok(SavedFile { path, size })
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp_path).await {
                    if cleanup.kind() != ErrorKind::NotFound {
                        warn!("Failed to remove temp file {:?}: {}", temp_path, cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    async fn write_temp<S, E>(&self, temp_path: &Path, body: S) -> GatewayResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let mut body = std::pin::pin!(body);
        let mut file = fs::File::create(temp_path).await?;
        let mut size: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk =
                chunk.map_err(|e| GatewayError::InvalidRequest(format!("upload stream failed: {}", e)))?;

            size += chunk.len() as u64;
            if size > self.max_file_size {
                return Err(GatewayError::InvalidRequest(format!(
                    "file exceeds {} byte limit",
                    self.max_file_size
                )));
            }

            for block in chunk.chunks(WRITE_CHUNK_SIZE) {
                file.write_all(block).await?;
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(size)
    }

    /// Remove the file for `id`; `false` if there was nothing to remove.
    pub async fn delete(&self, id: &str) -> GatewayResult<bool> {
        let path = self.file_path(id)?;
        let _guard = self.locks.acquire(id).await;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GatewayError::internal(format!("failed to delete file {}: {}", id, e))),
        }
    }

    pub async fn exists(&self, id: &str) -> GatewayResult<bool> {
        let path = self.file_path(id)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    pub async fn size(&self, id: &str) -> GatewayResult<Option<u64>> {
        let path = self.file_path(id)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read(&self, id: &str) -> GatewayResult<Option<Bytes>> {
        let path = self.file_path(id)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// SHA-256 of the stored file as lowercase hex.
    pub async fn hash(&self, id: &str) -> GatewayResult<Option<String>> {
        let path = self.file_path(id)?;
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BLOCK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }

    pub fn cleanup_locks(&self) -> usize {
        self.locks.cleanup()
    }

    /// Spawns a background task that periodically drops idle locks
    pub fn start_lock_gc(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.cleanup_locks();
                if removed > 0 {
                    debug!("Lock GC: removed {} idle file locks", removed);
                }
            }
        })
    }
}

/// Reject identifiers that could escape the storage root or collide with temp files.
pub fn validate_identifier(id: &str) -> GatewayResult<()> {
    let bad = id.is_empty()
        || id.len() > MAX_IDENTIFIER_LEN
        || id.starts_with('.')
        || id.contains("..")
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0');

    if bad {
        info!("Rejected file identifier {:?}", id);
        return Err(GatewayError::InvalidIdentifier(id.to_string()));
    }
    Ok(())
}
