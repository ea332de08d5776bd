//! Source image retrieval through the original-bytes cache.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::single_flight::{Flight, SingleFlight};
use super::stream_fanout::{FanoutSink, StorageSink, channel_sink, fanout};
use crate::domain::entities::CacheKey;
use crate::domain::errors::{ProxyError, StorageError};
use crate::domain::ports::{ByteStream, StoragePort, UpstreamPort};

const CLIENT_SINK: &str = "client";

/// Default number of chunks buffered between a fan-out and its reader.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// Fetches source images, caching the raw bytes under `sha3(url)`.
pub struct OriginFetcher {
    storage: Arc<dyn StoragePort>,
    upstream: Arc<dyn UpstreamPort>,
    flights: SingleFlight,
    channel_capacity: usize,
}

impl OriginFetcher {
    /// Creates a fetcher.
    #[must_use]
    pub fn new(storage: Arc<dyn StoragePort>, upstream: Arc<dyn UpstreamPort>) -> Self {
        Self {
            storage,
            upstream,
            flights: SingleFlight::new(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Overrides the read-ahead between the download and its consumer.
    #[must_use]
    pub const fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Returns a stream of the source bytes for `url`.
    ///
    /// A cached original is streamed from storage. Otherwise one download
    /// feeds both the returned stream and a storage write; concurrent calls
    /// for the same URL wait for that download and then read the stored copy.
    ///
    /// # Errors
    /// Returns [`ProxyError::UpstreamFetch`] if the download cannot start,
    /// or the leader's error when joining a failed download.
    #[instrument(skip(self), fields(key = tracing::field::Empty))]
    pub async fn fetch(&self, url: &str) -> Result<ByteStream, ProxyError> {
        let key = CacheKey::digest(url);
        tracing::Span::current().record("key", key.as_str());

        if self.storage.exists(&key).await {
            debug!("Origin cache hit");
            return Ok(self.storage.read_stream(&key).await?);
        }

        let guard = loop {
            let waiter = match self.flights.join(key.as_str()) {
                Flight::Leader(guard) => break guard,
                Flight::Follower(waiter) => waiter,
            };
            return match waiter.wait().await {
                Some(Ok(())) => Ok(self.storage.read_stream(&key).await?),
                Some(Err(ProxyError::Storage(e))) => {
                    warn!(error = %e, "Origin cache unavailable, fetching uncached");
                    Ok(self.upstream.get(url).await?)
                }
                Some(Err(e)) => Err(e),
                None => {
                    debug!("Origin download abandoned, joining again");
                    continue;
                }
            };
        };

        // Another leader may have committed between the lookup and the join.
        if self.storage.exists(&key).await {
            guard.complete(Ok(()));
            return Ok(self.storage.read_stream(&key).await?);
        }

        info!("Fetching origin");
        let body = match self.upstream.get(url).await {
            Ok(body) => body,
            Err(e) => {
                let err = ProxyError::from(e);
                guard.complete(Err(err.clone()));
                return Err(err);
            }
        };

        let (client, stream) = channel_sink(CLIENT_SINK, self.channel_capacity);
        let mut sinks: Vec<Box<dyn FanoutSink>> = vec![Box::new(client)];
        let cached = match self.storage.write_stream(&key).await {
            Ok(writer) => {
                sinks.push(Box::new(StorageSink::new(key.clone(), writer)));
                true
            }
            Err(e) => {
                warn!(error = %e, "Cannot open origin cache writer, serving uncached");
                false
            }
        };

        tokio::spawn(async move {
            let report = fanout(body, sinks).await;
            let outcome = if let Some(message) = report.source_error {
                Err(ProxyError::upstream(message))
            } else if let Some(failure) = report.failures.iter().find(|f| f.sink != CLIENT_SINK) {
                Err(StorageError::backend(failure.message.clone()).into())
            } else if cached {
                debug!(key = %key, bytes = report.bytes, "Origin cached");
                Ok(())
            } else {
                Err(StorageError::backend("origin cache writer unavailable").into())
            };
            guard.complete(outcome);
        });

        Ok(stream)
    }
}
