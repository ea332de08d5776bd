//! Storage backends.

pub mod local_storage;
pub mod object_storage;

use std::sync::Arc;

pub use local_storage::LocalStorage;
pub use object_storage::ObjectStorage;

use crate::domain::errors::StorageResult;
use crate::domain::ports::StoragePort;
use crate::infrastructure::config::StorageConfig;

/// Builds the configured backend. The caller runs [`StoragePort::init`].
///
/// # Errors
/// Returns [`crate::domain::errors::StorageError::Init`] if a bucket client
/// cannot be constructed.
pub fn build_storage(config: &StorageConfig) -> StorageResult<Arc<dyn StoragePort>> {
    let storage: Arc<dyn StoragePort> = match config {
        StorageConfig::Local { assets } => Arc::new(LocalStorage::new(assets.clone())),
        StorageConfig::Minio {
            endpoint,
            bucket,
            region,
            access_key,
            secret_key,
        } => Arc::new(ObjectStorage::minio(
            endpoint, bucket, region, access_key, secret_key,
        )?),
        StorageConfig::S3 {
            bucket,
            region,
            access_key,
            secret_key,
        } => Arc::new(ObjectStorage::s3(
            bucket,
            region,
            access_key.as_deref(),
            secret_key.as_deref(),
        )?),
        StorageConfig::Gcs {
            bucket,
            key_filename,
        } => Arc::new(ObjectStorage::gcs(bucket, key_filename.as_deref())?),
    };
    Ok(storage)
}
