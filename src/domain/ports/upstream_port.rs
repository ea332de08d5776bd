//! Port for fetching source images from their origin.

use async_trait::async_trait;

use super::storage_port::ByteStream;
use crate::domain::errors::FetchError;

/// Streaming HTTP GET against a source URL.
#[async_trait]
pub trait UpstreamPort: Send + Sync {
    /// Starts a download. Errors after the first chunk surface through the
    /// stream.
    async fn get(&self, url: &str) -> Result<ByteStream, FetchError>;
}
