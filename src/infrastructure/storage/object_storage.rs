//! Bucket storage over `object_store`: MinIO, Amazon S3 and Google Cloud
//! Storage.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, WriteMultipart};
use tracing::{debug, info, warn};

use crate::domain::entities::CacheKey;
use crate::domain::errors::{StorageError, StorageResult};
use crate::domain::ports::{BlobWriter, ByteStream, StoragePort};

/// Concurrent part uploads per writer.
const MAX_PART_UPLOADS: usize = 4;

/// A bucket behind any `object_store` backend.
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    kind: &'static str,
}

impl ObjectStorage {
    /// Wraps an existing store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, kind: &'static str) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            kind,
        }
    }

    /// MinIO or another S3-compatible server at `endpoint`.
    ///
    /// # Errors
    /// Returns [`StorageError::Init`] if the client cannot be built.
    pub fn minio(
        endpoint: &str,
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> StorageResult<Self> {
        let store = AmazonS3Builder::new()
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(false)
            .with_bucket_name(bucket)
            .with_region(region)
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key)
            .build()
            .map_err(|e| StorageError::init(format!("minio client: {e}")))?;
        Ok(Self::new(Arc::new(store), bucket, "minio"))
    }

    /// Amazon S3. Missing keys are taken from the environment.
    ///
    /// # Errors
    /// Returns [`StorageError::Init`] if the client cannot be built.
    pub fn s3(
        bucket: &str,
        region: &str,
        access_key: Option<&str>,
        secret_key: Option<&str>,
    ) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region);
        if let (Some(access_key), Some(secret_key)) = (access_key, secret_key) {
            builder = builder
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::init(format!("s3 client: {e}")))?;
        Ok(Self::new(Arc::new(store), bucket, "s3"))
    }

    /// Google Cloud Storage. Without a key file, ambient credentials are used.
    ///
    /// # Errors
    /// Returns [`StorageError::Init`] if the client cannot be built.
    pub fn gcs(bucket: &str, key_filename: Option<&std::path::Path>) -> StorageResult<Self> {
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(path) = key_filename {
            builder = builder.with_service_account_path(path.to_string_lossy());
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::init(format!("gcs client: {e}")))?;
        Ok(Self::new(Arc::new(store), bucket, "gcs"))
    }

    fn path(key: &CacheKey) -> ObjectPath {
        ObjectPath::from(key.as_str())
    }
}

fn map_error(key: &CacheKey, error: object_store::Error) -> StorageError {
    match error {
        object_store::Error::NotFound { .. } => StorageError::not_found(key.as_str()),
        other => StorageError::backend(other.to_string()),
    }
}

#[async_trait]
impl StoragePort for ObjectStorage {
    async fn init(&self) -> StorageResult<()> {
        self.store
            .list_with_delimiter(None)
            .await
            .map_err(|e| StorageError::init(format!("bucket `{}` unreachable: {e}", self.bucket)))?;
        info!(backend = self.kind, bucket = %self.bucket, "Bucket storage ready");
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> bool {
        match self.store.head(&Self::path(key)).await {
            Ok(_) => true,
            Err(object_store::Error::NotFound { .. }) => false,
            Err(e) => {
                warn!(backend = self.kind, key = %key, error = %e, "Existence check failed");
                false
            }
        }
    }

    async fn read_stream(&self, key: &CacheKey) -> StorageResult<ByteStream> {
        let result = self
            .store
            .get(&Self::path(key))
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(result
            .into_stream()
            .map_err(|e| io::Error::other(e.to_string()))
            .boxed())
    }

    async fn write_stream(&self, key: &CacheKey) -> StorageResult<Box<dyn BlobWriter>> {
        let upload = self
            .store
            .put_multipart(&Self::path(key))
            .await
            .map_err(|e| map_error(key, e))?;
        Ok(Box::new(ObjectBlobWriter {
            key: key.clone(),
            upload: WriteMultipart::new(upload),
        }))
    }

    async fn delete(&self, key: &CacheKey) -> StorageResult<()> {
        match self.store.delete(&Self::path(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(StorageError::backend(e.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        self.kind
    }
}

/// Multipart upload; the object only appears once the upload completes.
struct ObjectBlobWriter {
    key: CacheKey,
    upload: WriteMultipart,
}

#[async_trait]
impl BlobWriter for ObjectBlobWriter {
    async fn write(&mut self, chunk: Bytes) -> StorageResult<()> {
        self.upload
            .wait_for_capacity(MAX_PART_UPLOADS)
            .await
            .map_err(|e| StorageError::backend(e.to_string()))?;
        self.upload.put(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let Self { key, upload } = *self;
        upload
            .finish()
            .await
            .map_err(|e| StorageError::backend(format!("upload of {key} failed: {e}")))?;
        debug!(key = %key, "Object committed");
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let Self { key, upload } = *self;
        if let Err(e) = upload.abort().await {
            warn!(key = %key, error = %e, "Failed to abort multipart upload");
        }
    }
}
