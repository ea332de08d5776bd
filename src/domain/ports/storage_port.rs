//! Content-addressed blob storage port.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::domain::entities::CacheKey;
use crate::domain::errors::StorageResult;

/// Owned, pinned stream of byte chunks.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Streaming byte store shared by original and derived blobs.
/// Implementations must be thread-safe.
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// One-time startup probe. Failure is fatal to process start.
    async fn init(&self) -> StorageResult<()>;

    /// Returns whether a committed blob exists. Backend errors read as
    /// absent.
    async fn exists(&self, key: &CacheKey) -> bool;

    /// Streams a committed blob.
    async fn read_stream(&self, key: &CacheKey) -> StorageResult<ByteStream>;

    /// Opens a writer. Nothing is visible under `key` until the writer is
    /// committed.
    async fn write_stream(&self, key: &CacheKey) -> StorageResult<Box<dyn BlobWriter>>;

    /// Removes a blob. Missing keys are not an error.
    async fn delete(&self, key: &CacheKey) -> StorageResult<()>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Incremental blob writer.
#[async_trait]
pub trait BlobWriter: Send {
    /// Appends a chunk.
    async fn write(&mut self, chunk: Bytes) -> StorageResult<()>;

    /// Publishes the blob atomically.
    async fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Discards everything written so far.
    async fn abort(self: Box<Self>);
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::domain::errors::StorageError;
    use futures_util::stream;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const READ_CHUNK: usize = 8 * 1024;

    /// In-memory storage for testing.
    #[derive(Default)]
    pub struct MemoryStorage {
        blobs: Arc<Mutex<HashMap<CacheKey, Bytes>>>,
        commits: Arc<AtomicUsize>,
        fail_writes: AtomicBool,
    }

    impl MemoryStorage {
        /// Creates empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Inserts a committed blob.
        pub fn insert(&self, key: &CacheKey, data: impl Into<Bytes>) {
            self.blobs.lock().insert(key.clone(), data.into());
        }

        /// Returns a committed blob.
        pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
            self.blobs.lock().get(key).cloned()
        }

        /// Number of committed writes.
        pub fn commits(&self) -> usize {
            self.commits.load(Ordering::SeqCst)
        }

        /// Makes every subsequent writer fail on its first chunk.
        pub fn fail_writes(&self) {
            self.fail_writes.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StoragePort for MemoryStorage {
        async fn init(&self) -> StorageResult<()> {
            Ok(())
        }

        async fn exists(&self, key: &CacheKey) -> bool {
            self.blobs.lock().contains_key(key)
        }

        async fn read_stream(&self, key: &CacheKey) -> StorageResult<ByteStream> {
            let data = self
                .get(key)
                .ok_or_else(|| StorageError::not_found(key.as_str()))?;
            let chunks: Vec<io::Result<Bytes>> = (0..data.len())
                .step_by(READ_CHUNK)
                .map(|start| Ok(data.slice(start..(start + READ_CHUNK).min(data.len()))))
                .collect();
            Ok(Box::pin(stream::iter(chunks)))
        }

        async fn write_stream(&self, key: &CacheKey) -> StorageResult<Box<dyn BlobWriter>> {
            Ok(Box::new(MemoryWriter {
                key: key.clone(),
                buffer: Vec::new(),
                blobs: Arc::clone(&self.blobs),
                commits: Arc::clone(&self.commits),
                fail: self.fail_writes.load(Ordering::SeqCst),
            }))
        }

        async fn delete(&self, key: &CacheKey) -> StorageResult<()> {
            self.blobs.lock().remove(key);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "memory"
        }
    }

    struct MemoryWriter {
        key: CacheKey,
        buffer: Vec<u8>,
        blobs: Arc<Mutex<HashMap<CacheKey, Bytes>>>,
        commits: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl BlobWriter for MemoryWriter {
        async fn write(&mut self, chunk: Bytes) -> StorageResult<()> {
            if self.fail {
                return Err(StorageError::io("disk full"));
            }
            self.buffer.extend_from_slice(&chunk);
            Ok(())
        }

        async fn commit(self: Box<Self>) -> StorageResult<()> {
            self.blobs.lock().insert(self.key, Bytes::from(self.buffer));
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn abort(self: Box<Self>) {}
    }
}
