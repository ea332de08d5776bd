//! Duplicates one byte stream to several sinks.
//!
//! Every chunk is handed to all live sinks before the next chunk is pulled
//! from the source, so the slowest sink paces the whole fan-out and memory
//! stays bounded by the channel capacities. A failing sink is dropped from
//! the set and reported; the others keep receiving data.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::domain::entities::CacheKey;
use crate::domain::ports::{BlobWriter, ByteStream};

/// Destination of a fan-out.
#[async_trait]
pub trait FanoutSink: Send {
    /// Name used in reports and logs.
    fn name(&self) -> &str;

    /// Delivers one chunk. Waits while the sink is full.
    async fn send(&mut self, chunk: Bytes) -> Result<(), String>;

    /// Ends delivery. `complete` is false when the source failed, in which
    /// case the sink must discard what it received.
    async fn finish(self: Box<Self>, complete: bool) -> Result<(), String>;
}

/// A sink that failed during the fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFailure {
    /// Sink name.
    pub sink: String,
    /// Failure description.
    pub message: String,
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Default)]
pub struct FanoutReport {
    /// Bytes read from the source.
    pub bytes: u64,
    /// Sinks that failed, in failure order.
    pub failures: Vec<SinkFailure>,
    /// Set when the source itself failed.
    pub source_error: Option<String>,
}

impl FanoutReport {
    /// Every sink received the full stream.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.source_error.is_none() && self.failures.is_empty()
    }

    /// Returns the failure recorded for a sink.
    #[must_use]
    pub fn failure(&self, sink: &str) -> Option<&SinkFailure> {
        self.failures.iter().find(|f| f.sink == sink)
    }
}

/// Feeds a bounded channel consumed as a [`ByteStream`].
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<io::Result<Bytes>>,
}

/// Creates a channel sink and the stream that drains it.
///
/// The source is never more than `capacity` chunks ahead of the reader.
#[must_use]
pub fn channel_sink(name: impl Into<String>, capacity: usize) -> (ChannelSink, ByteStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = ChannelSink {
        name: name.into(),
        tx,
    };
    (sink, Box::pin(ReceiverStream::new(rx)))
}

#[async_trait]
impl FanoutSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), String> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| "receiver dropped".to_string())
    }

    async fn finish(self: Box<Self>, complete: bool) -> Result<(), String> {
        if !complete {
            // Readers see an error instead of a silently truncated body.
            let _ = self
                .tx
                .send(Err(io::Error::other("source stream failed")))
                .await;
        }
        Ok(())
    }
}

/// Writes into storage; commits only if the whole stream arrived.
pub struct StorageSink {
    name: String,
    key: CacheKey,
    writer: Box<dyn BlobWriter>,
}

impl StorageSink {
    /// Wraps an open writer.
    #[must_use]
    pub fn new(key: CacheKey, writer: Box<dyn BlobWriter>) -> Self {
        Self {
            name: format!("storage:{key}"),
            key,
            writer,
        }
    }
}

#[async_trait]
impl FanoutSink for StorageSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), String> {
        self.writer.write(chunk).await.map_err(|e| e.to_string())
    }

    async fn finish(self: Box<Self>, complete: bool) -> Result<(), String> {
        if complete {
            self.writer.commit().await.map_err(|e| e.to_string())?;
            debug!(key = %self.key, "Committed blob");
        } else {
            self.writer.abort().await;
            debug!(key = %self.key, "Aborted blob");
        }
        Ok(())
    }
}

/// Copies `source` into every sink and reports the outcome.
///
/// A sink whose `send` fails is finished as incomplete and skipped for the
/// rest of the stream. A source error finishes every remaining sink as
/// incomplete.
pub async fn fanout(mut source: ByteStream, sinks: Vec<Box<dyn FanoutSink>>) -> FanoutReport {
    let mut live: Vec<Option<Box<dyn FanoutSink>>> = sinks.into_iter().map(Some).collect();
    let mut report = FanoutReport::default();

    while let Some(item) = source.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "Fan-out source failed");
                report.source_error = Some(e.to_string());
                break;
            }
        };
        report.bytes += chunk.len() as u64;

        let results = join_all(
            live.iter_mut()
                .flatten()
                .map(|sink| sink.send(chunk.clone())),
        )
        .await;

        let mut failed = Vec::new();
        let mut results = results.into_iter();
        for (index, slot) in live.iter().enumerate() {
            if slot.is_some()
                && let Some(Err(message)) = results.next()
            {
                failed.push((index, message));
            }
        }

        for (index, message) in failed {
            if let Some(sink) = live[index].take() {
                warn!(sink = sink.name(), error = %message, "Fan-out sink failed");
                report.failures.push(SinkFailure {
                    sink: sink.name().to_string(),
                    message,
                });
                let _ = sink.finish(false).await;
            }
        }

        if live.iter().all(Option::is_none) {
            debug!("All fan-out sinks are gone, stopping early");
            break;
        }
    }

    let complete = report.source_error.is_none();
    for sink in live.into_iter().flatten() {
        let name = sink.name().to_string();
        if let Err(message) = sink.finish(complete).await {
            warn!(sink = %name, error = %message, "Fan-out sink failed to finish");
            report.failures.push(SinkFailure { sink: name, message });
        }
    }

    report
}

/// Drains a stream into memory.
///
/// # Errors
/// Returns the first stream error.
pub async fn collect_stream(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer)
}
