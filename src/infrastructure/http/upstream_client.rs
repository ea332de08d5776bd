//! Source image downloads over HTTP.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::Client;
use tracing::{debug, instrument};

use crate::domain::errors::FetchError;
use crate::domain::ports::{ByteStream, UpstreamPort};

const USER_AGENT: &str = concat!("morphus/", env!("CARGO_PKG_VERSION"));

/// reqwest-backed [`UpstreamPort`] with a body size ceiling.
pub struct HttpUpstream {
    client: Client,
    max_body_bytes: u64,
}

impl HttpUpstream {
    /// Creates a client with a whole-request timeout.
    ///
    /// # Errors
    /// Returns error if HTTP client creation fails.
    pub fn new(timeout: Duration, max_body_bytes: u64) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::request("-", format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_body_bytes,
        })
    }
}

#[async_trait]
impl UpstreamPort for HttpUpstream {
    #[instrument(skip(self))]
    async fn get(&self, url: &str) -> Result<ByteStream, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::request(url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let limit = self.max_body_bytes;
        if let Some(length) = response.content_length()
            && length > limit
        {
            return Err(FetchError::TooLarge { limit });
        }
        debug!(status = status.as_u16(), length = ?response.content_length(), "Upstream responded");

        // Chunked bodies are checked as they arrive.
        let received = Arc::new(AtomicU64::new(0));
        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::other(FetchError::body(e.to_string())))
            .and_then(move |chunk| {
                let total = received.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
                futures_util::future::ready(if total > limit {
                    Err(io::Error::other(FetchError::TooLarge { limit }))
                } else {
                    Ok(chunk)
                })
            });
        Ok(stream.boxed())
    }
}
