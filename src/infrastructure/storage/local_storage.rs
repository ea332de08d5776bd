//! Filesystem storage rooted at a configured directory.
//!
//! Keys are sharded by their first two characters (`ab/abcdef...`). Writes
//! go to a temporary file in the shard directory and are renamed into place
//! on commit, so readers never observe a partial blob.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::domain::entities::CacheKey;
use crate::domain::errors::{StorageError, StorageResult};
use crate::domain::ports::{BlobWriter, ByteStream, StoragePort};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Stores blobs as files under `root`.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Creates a store rooted at `root`. Nothing is touched until
    /// [`StoragePort::init`].
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, key: &CacheKey) -> PathBuf {
        let shard = key.as_str().get(..2).unwrap_or("00");
        self.root.join(shard)
    }

    fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.shard_dir(key).join(key.as_str())
    }
}

#[async_trait]
impl StoragePort for LocalStorage {
    async fn init(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            StorageError::init(format!("cannot create {}: {e}", self.root.display()))
        })?;

        let probe = self.root.join(".morphus-probe");
        fs::write(&probe, b"ok")
            .await
            .map_err(|e| StorageError::init(format!("{} is not writable: {e}", self.root.display())))?;
        let _ = fs::remove_file(&probe).await;

        info!(root = %self.root.display(), "Local storage ready");
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> bool {
        fs::try_exists(self.blob_path(key)).await.unwrap_or(false)
    }

    async fn read_stream(&self, key: &CacheKey) -> StorageResult<ByteStream> {
        let path = self.blob_path(key);
        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::not_found(key.as_str())
            } else {
                StorageError::io(format!("cannot open {}: {e}", path.display()))
            }
        })?;
        Ok(ReaderStream::with_capacity(file, READ_BUFFER_SIZE).boxed())
    }

    async fn write_stream(&self, key: &CacheKey) -> StorageResult<Box<dyn BlobWriter>> {
        let dir = self.shard_dir(key);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(format!("cannot create {}: {e}", dir.display())))?;

        let temp_dir = dir.clone();
        let temp = tokio::task::spawn_blocking(move || NamedTempFile::new_in(temp_dir))
            .await
            .map_err(|e| StorageError::io(e.to_string()))?
            .map_err(|e| StorageError::io(format!("cannot create temp file: {e}")))?;
        let (file, temp_path) = temp.into_parts();

        Ok(Box::new(LocalBlobWriter {
            file: fs::File::from_std(file),
            temp_path,
            target: self.blob_path(key),
        }))
    }

    async fn delete(&self, key: &CacheKey) -> StorageResult<()> {
        match fs::remove_file(self.blob_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(e.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Temp-file writer; dropping it without commit removes the temp file.
struct LocalBlobWriter {
    file: fs::File,
    temp_path: TempPath,
    target: PathBuf,
}

#[async_trait]
impl BlobWriter for LocalBlobWriter {
    async fn write(&mut self, chunk: Bytes) -> StorageResult<()> {
        self.file
            .write_all(&chunk)
            .await
            .map_err(|e| StorageError::io(format!("write failed: {e}")))
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let Self {
            mut file,
            temp_path,
            target,
        } = *self;
        file.flush()
            .await
            .map_err(|e| StorageError::io(format!("flush failed: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(format!("sync failed: {e}")))?;
        drop(file);

        let destination = target.clone();
        tokio::task::spawn_blocking(move || temp_path.persist(&destination))
            .await
            .map_err(|e| StorageError::io(e.to_string()))?
            .map_err(|e| StorageError::io(format!("rename failed: {}", e.error)))?;

        debug!(path = %target.display(), "Blob committed");
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let Self { file, temp_path, .. } = *self;
        drop(file);
        match tokio::task::spawn_blocking(move || temp_path.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to remove temp file"),
            Err(e) => warn!(error = %e, "Temp file cleanup task failed"),
        }
    }
}
