//! Image request use case: parse, authorize, look up, compute, serve.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, instrument, warn};

use crate::application::services::{
    FanoutSink, Flight, FlightGuard, OriginFetcher, SingleFlight, StorageSink, TransformPipeline,
    channel_sink, collect_stream, fanout,
};
use crate::domain::entities::{CacheKey, DescriptorRules, PipelineSpec, RequestDescriptor};
use crate::domain::errors::{ProxyError, StorageError};
use crate::domain::ports::{ByteStream, OperandImages, StoragePort};
use crate::domain::services::{AccessPolicy, NegotiationContext};

const CLIENT_SINK: &str = "client";

/// Inbound request data relevant to image serving.
#[derive(Debug, Clone, Default)]
pub struct ServeImageRequest {
    /// Decoded query pairs in request order.
    pub query: Vec<(String, String)>,
    /// `Accept` header.
    pub accept: Option<String>,
    /// `User-Agent` header.
    pub user_agent: Option<String>,
    /// `Origin` header.
    pub origin: Option<String>,
}

impl ServeImageRequest {
    fn negotiation_context(&self) -> Option<NegotiationContext> {
        (self.accept.is_some() || self.user_agent.is_some())
            .then(|| NegotiationContext::new(self.accept.clone(), self.user_agent.clone()))
    }
}

/// How a response body was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Streamed from storage.
    Hit,
    /// Computed by this request.
    Miss,
    /// Computed by a concurrent request and read back from storage.
    Coalesced,
}

impl CacheStatus {
    /// Lowercase label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Coalesced => "coalesced",
        }
    }
}

/// A response ready to stream.
pub struct ServedImage {
    /// Derived-variant key, used as the entity tag.
    pub cache_key: CacheKey,
    /// `image/<format>`.
    pub content_type: String,
    /// Cache lifetime.
    pub max_age: Duration,
    /// `now + max_age`.
    pub expires: DateTime<Utc>,
    /// Encoded image bytes.
    pub body: ByteStream,
    /// Where the body came from.
    pub cache_status: CacheStatus,
}

impl std::fmt::Debug for ServedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServedImage")
            .field("cache_key", &self.cache_key)
            .field("content_type", &self.content_type)
            .field("expires", &self.expires)
            .field("cache_status", &self.cache_status)
            .finish_non_exhaustive()
    }
}

/// Settings the use case reads on every request.
#[derive(Debug, Clone)]
pub struct ServeSettings {
    /// Descriptor parsing rules.
    pub rules: DescriptorRules,
    /// Allow-lists.
    pub policy: AccessPolicy,
    /// Response cache lifetime.
    pub max_age: Duration,
    /// Chunks buffered between the transform output and the client.
    pub channel_capacity: usize,
}

/// Serves transformed images, populating the cache on misses.
pub struct ServeImageUseCase {
    settings: ServeSettings,
    storage: Arc<dyn StoragePort>,
    origin: Arc<OriginFetcher>,
    pipeline: Arc<TransformPipeline>,
    flights: SingleFlight,
}

impl ServeImageUseCase {
    /// Creates new use case.
    #[must_use]
    pub fn new(
        settings: ServeSettings,
        storage: Arc<dyn StoragePort>,
        origin: Arc<OriginFetcher>,
        pipeline: Arc<TransformPipeline>,
    ) -> Self {
        Self {
            settings,
            storage,
            origin,
            pipeline,
            flights: SingleFlight::new(),
        }
    }

    /// Handles one image request.
    ///
    /// Validation, authorization and pipeline construction all happen before
    /// any storage or network access.
    ///
    /// # Errors
    /// Returns a [`ProxyError`] describing the first failed stage.
    #[instrument(skip_all, fields(key = tracing::field::Empty))]
    pub async fn execute(&self, request: ServeImageRequest) -> Result<ServedImage, ProxyError> {
        let descriptor = RequestDescriptor::parse(
            &request.query,
            &self.settings.rules,
            request.negotiation_context().as_ref(),
        )?;
        tracing::Span::current().record("key", descriptor.cache_key().as_str());

        self.settings
            .policy
            .authorize(descriptor.url(), request.origin.as_deref())?;

        let spec = TransformPipeline::build(&descriptor)?;
        for operand in spec.operand_urls() {
            self.settings.policy.authorize_source(operand)?;
        }

        let key = descriptor.cache_key().clone();
        let (body, cache_status) = self.lookup_or_compute(&descriptor, spec).await?;

        let content_type = descriptor.output().format.content_type();
        info!(
            cache = cache_status.as_str(),
            url = descriptor.url(),
            content_type = %content_type,
            "Serving image"
        );
        let max_age = self.settings.max_age;
        let expires = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_add_signed(age))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok(ServedImage {
            cache_key: key,
            content_type,
            max_age,
            expires,
            body,
            cache_status,
        })
    }

    async fn lookup_or_compute(
        &self,
        descriptor: &RequestDescriptor,
        spec: PipelineSpec,
    ) -> Result<(ByteStream, CacheStatus), ProxyError> {
        let key = descriptor.cache_key();

        if self.storage.exists(key).await {
            return Ok((self.storage.read_stream(key).await?, CacheStatus::Hit));
        }

        let guard = loop {
            let waiter = match self.flights.join(key.as_str()) {
                Flight::Leader(guard) => break guard,
                Flight::Follower(waiter) => waiter,
            };
            return match waiter.wait().await {
                Some(Ok(())) => Ok((self.storage.read_stream(key).await?, CacheStatus::Coalesced)),
                Some(Err(ProxyError::Storage(e))) => {
                    warn!(error = %e, "Variant cache unavailable, rendering uncached");
                    Ok((self.renderer().render(descriptor, spec).await?, CacheStatus::Miss))
                }
                Some(Err(e)) => Err(e),
                None => {
                    debug!("Variant render abandoned, joining again");
                    continue;
                }
            };
        };

        // The task owns the guard and keeps running if this future is dropped.
        let (reply, response) = oneshot::channel();
        let renderer = self.renderer();
        let descriptor = descriptor.clone();
        tokio::spawn(
            async move {
                renderer.lead(&descriptor, spec, guard, reply).await;
            }
            .in_current_span(),
        );
        response
            .await
            .map_err(|_| ProxyError::transform("render task ended without a response"))?
    }

    fn renderer(&self) -> VariantRenderer {
        VariantRenderer {
            storage: Arc::clone(&self.storage),
            origin: Arc::clone(&self.origin),
            pipeline: Arc::clone(&self.pipeline),
            channel_capacity: self.settings.channel_capacity,
        }
    }
}

type Reply = oneshot::Sender<Result<(ByteStream, CacheStatus), ProxyError>>;

/// Owned handles for rendering a variant off the request task.
struct VariantRenderer {
    storage: Arc<dyn StoragePort>,
    origin: Arc<OriginFetcher>,
    pipeline: Arc<TransformPipeline>,
    channel_capacity: usize,
}

impl VariantRenderer {
    /// Leader path: render, answer the requester, then fan the output out
    /// to the client and the cache before releasing followers.
    async fn lead(
        self,
        descriptor: &RequestDescriptor,
        spec: PipelineSpec,
        guard: FlightGuard,
        reply: Reply,
    ) {
        let key = descriptor.cache_key();

        // Another leader may have committed between the lookup and the join.
        if self.storage.exists(key).await {
            guard.complete(Ok(()));
            let stored = self.storage.read_stream(key).await.map_err(ProxyError::from);
            let _ = reply.send(stored.map(|body| (body, CacheStatus::Hit)));
            return;
        }

        let output = match self.render(descriptor, spec).await {
            Ok(output) => output,
            Err(e) => {
                guard.complete(Err(e.clone()));
                let _ = reply.send(Err(e));
                return;
            }
        };

        let (client, body) = channel_sink(CLIENT_SINK, self.channel_capacity);
        let mut sinks: Vec<Box<dyn FanoutSink>> = vec![Box::new(client)];
        let cached = match self.storage.write_stream(key).await {
            Ok(writer) => {
                sinks.push(Box::new(StorageSink::new(key.clone(), writer)));
                true
            }
            Err(e) => {
                warn!(error = %e, "Cannot open variant cache writer, serving uncached");
                false
            }
        };
        if reply.send(Ok((body, CacheStatus::Miss))).is_err() {
            debug!(key = %key, "Client gone, still populating the cache");
        }

        let report = fanout(output, sinks).await;
        let outcome = if let Some(message) = report.source_error {
            Err(ProxyError::transform(message))
        } else if let Some(failure) = report.failures.iter().find(|f| f.sink != CLIENT_SINK) {
            Err(StorageError::backend(failure.message.clone()).into())
        } else if cached {
            debug!(key = %key, bytes = report.bytes, "Variant cached");
            Ok(())
        } else {
            Err(StorageError::backend("variant cache writer unavailable").into())
        };
        guard.complete(outcome);
    }

    /// Fetches the source and operands, then runs the pipeline.
    async fn render(
        &self,
        descriptor: &RequestDescriptor,
        spec: PipelineSpec,
    ) -> Result<ByteStream, ProxyError> {
        let source = self.origin.fetch(descriptor.url()).await?;

        let mut operands = OperandImages::new();
        for url in spec.operand_urls() {
            let stream = self.origin.fetch(url).await?;
            let bytes = collect_stream(stream)
                .await
                .map_err(|e| ProxyError::upstream(format!("failed to read operand {url}: {e}")))?;
            operands.insert(url.to_string(), bytes);
        }

        self.pipeline.run(spec, source, operands).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::ImageFormat;
    use crate::domain::errors::EngineError;
    use crate::domain::ports::ImageEnginePort;
    use crate::domain::ports::mocks::{MemoryStorage, StaticUpstream};
    use crate::domain::services::MatchRule;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SOURCE: &str = "https://cdn.example.com/cat.png";
    const MASK: &str = "https://cdn.example.com/mask.png";

    /// Reverses the input and appends the operation names.
    #[derive(Default)]
    struct RecordingEngine {
        renders: AtomicUsize,
        operands: Mutex<Vec<String>>,
        fail: bool,
    }

    impl ImageEnginePort for RecordingEngine {
        fn render(
            &self,
            spec: &PipelineSpec,
            source: &[u8],
            operands: &OperandImages,
        ) -> Result<Vec<u8>, EngineError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            self.operands.lock().extend(operands.keys().cloned());
            if self.fail {
                return Err(EngineError::Decode("not an image".into()));
            }
            let mut out: Vec<u8> = source.iter().rev().copied().collect();
            for op in &spec.operations {
                out.extend_from_slice(op.name().as_bytes());
            }
            Ok(out)
        }
    }

    struct Harness {
        storage: Arc<MemoryStorage>,
        upstream: Arc<StaticUpstream>,
        engine: Arc<RecordingEngine>,
        use_case: Arc<ServeImageUseCase>,
    }

    fn harness_with(upstream: StaticUpstream, engine: RecordingEngine, policy: AccessPolicy) -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let upstream = Arc::new(upstream);
        let engine = Arc::new(engine);
        let origin = Arc::new(OriginFetcher::new(storage.clone(), upstream.clone()));
        let pipeline = Arc::new(TransformPipeline::new(engine.clone()));
        let settings = ServeSettings {
            rules: DescriptorRules::default(),
            policy,
            max_age: Duration::from_secs(86_400),
            channel_capacity: 4,
        };
        let use_case = Arc::new(ServeImageUseCase::new(settings, storage.clone(), origin, pipeline));
        Harness {
            storage,
            upstream,
            engine,
            use_case,
        }
    }

    fn harness() -> Harness {
        harness_with(
            StaticUpstream::new()
                .with_body(SOURCE, vec![5_u8; 200_000])
                .with_body(MASK, vec![1_u8; 10]),
            RecordingEngine::default(),
            AccessPolicy::default(),
        )
    }

    fn request(query: &str) -> ServeImageRequest {
        ServeImageRequest {
            query: url::form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            accept: Some("image/webp,*/*".into()),
            ..ServeImageRequest::default()
        }
    }

    async fn body_of(served: ServedImage) -> Vec<u8> {
        collect_stream(served.body).await.unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_second_request_is_a_hit() {
        let h = harness();
        let query = format!("url={SOURCE}&op=flip&width=10");

        let first = h.use_case.execute(request(&query)).await.unwrap();
        assert_eq!(first.cache_status, CacheStatus::Miss);
        assert_eq!(first.content_type, "image/webp");
        let key = first.cache_key.clone();
        let first_body = body_of(first).await;
        settle().await;

        let second = h.use_case.execute(request(&query)).await.unwrap();
        assert_eq!(second.cache_status, CacheStatus::Hit);
        assert_eq!(second.cache_key, key);
        assert_eq!(body_of(second).await, first_body);

        assert_eq!(h.upstream.fetches(), 1);
        assert_eq!(h.engine.renders.load(Ordering::SeqCst), 1);
        assert_eq!(h.storage.get(&key).unwrap().as_ref(), first_body.as_slice());
    }

    #[tokio::test]
    async fn test_origin_is_reused_across_variants() {
        let h = harness();

        body_of(h.use_case.execute(request(&format!("url={SOURCE}&op=flip"))).await.unwrap()).await;
        settle().await;
        body_of(h.use_case.execute(request(&format!("url={SOURCE}&op=flop"))).await.unwrap()).await;

        assert_eq!(h.upstream.fetches(), 1);
        assert_eq!(h.engine.renders.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsupported_operation_fails_before_io() {
        let h = harness();
        let req = request(&format!("url={SOURCE}&op=explode"));
        let descriptor =
            RequestDescriptor::parse(&req.query, &DescriptorRules::default(), req.negotiation_context().as_ref())
                .unwrap();

        let err = h.use_case.execute(req).await.unwrap_err();

        assert!(matches!(err, ProxyError::Pipeline(_)));
        assert_eq!(h.upstream.fetches(), 0);
        assert!(!h.storage.exists(descriptor.cache_key()).await);
    }

    #[tokio::test]
    async fn test_engine_failure_leaves_variant_absent() {
        let h = harness_with(
            StaticUpstream::new().with_body(SOURCE, b"garbage".to_vec()),
            RecordingEngine {
                fail: true,
                ..RecordingEngine::default()
            },
            AccessPolicy::default(),
        );
        let req = request(&format!("url={SOURCE}&op=flip"));
        let descriptor =
            RequestDescriptor::parse(&req.query, &DescriptorRules::default(), req.negotiation_context().as_ref())
                .unwrap();

        let err = h.use_case.execute(req).await.unwrap_err();
        settle().await;

        assert!(matches!(err, ProxyError::Transform { .. }));
        assert!(!h.storage.exists(descriptor.cache_key()).await);
        assert_eq!(h.storage.commits(), 1, "only the origin is cached");
    }

    #[tokio::test]
    async fn test_broken_upstream_caches_nothing() {
        let h = harness_with(
            StaticUpstream::new().with_broken_body(SOURCE, vec![0_u8; 4096]),
            RecordingEngine::default(),
            AccessPolicy::default(),
        );

        let err = h.use_case.execute(request(&format!("url={SOURCE}"))).await.unwrap_err();
        settle().await;

        assert!(matches!(err, ProxyError::UpstreamFetch { .. }));
        assert_eq!(h.storage.commits(), 0);
        assert_eq!(h.engine.renders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_validation_error_touches_nothing() {
        let h = harness();
        let err = h
            .use_case
            .execute(request(&format!("url={SOURCE}&resize=cover")))
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Validation(_)));
        assert_eq!(h.upstream.fetches(), 0);
    }

    #[tokio::test]
    async fn test_auto_format_without_headers_is_rejected() {
        let h = harness();
        let mut req = request(&format!("url={SOURCE}"));
        req.accept = None;

        let err = h.use_case.execute(req).await.unwrap_err();
        assert!(matches!(err, ProxyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_forbidden_domain() {
        let policy = AccessPolicy::new(Some(vec![MatchRule::Prefix("https://allowed.test".into())]), None);
        let h = harness_with(StaticUpstream::new().with_body(SOURCE, b"x".to_vec()), RecordingEngine::default(), policy);

        let err = h.use_case.execute(request(&format!("url={SOURCE}"))).await.unwrap_err();

        assert!(matches!(err, ProxyError::Forbidden { .. }));
        assert_eq!(h.upstream.fetches(), 0);
    }

    #[tokio::test]
    async fn test_forbidden_origin_header() {
        let policy = AccessPolicy::new(None, Some(vec![MatchRule::Prefix("https://app.test".into())]));
        let h = harness_with(StaticUpstream::new().with_body(SOURCE, b"x".to_vec()), RecordingEngine::default(), policy);

        let mut req = request(&format!("url={SOURCE}"));
        req.origin = Some("https://evil.test".into());

        assert!(matches!(
            h.use_case.execute(req).await.unwrap_err(),
            ProxyError::Forbidden { .. }
        ));
    }

    #[tokio::test]
    async fn test_boolean_operand_is_fetched_and_passed_to_engine() {
        let h = harness();
        let query = format!("url={SOURCE}&op=boolean|operand:{MASK},operator:and");

        body_of(h.use_case.execute(request(&query)).await.unwrap()).await;

        assert_eq!(h.engine.operands.lock().as_slice(), [MASK.to_string()]);
        assert_eq!(h.upstream.fetches(), 2);
    }

    #[tokio::test]
    async fn test_operand_domain_is_checked() {
        let policy = AccessPolicy::new(Some(vec![MatchRule::Prefix("https://cdn.example.com".into())]), None);
        let h = harness_with(StaticUpstream::new().with_body(SOURCE, b"x".to_vec()), RecordingEngine::default(), policy);
        let query = format!("url={SOURCE}&op=boolean|operand:https://evil.test/m.png,operator:or");

        let err = h.use_case.execute(request(&query)).await.unwrap_err();
        assert!(matches!(err, ProxyError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_coalesce() {
        let h = harness_with(
            StaticUpstream::new()
                .with_body(SOURCE, vec![8_u8; 128 * 1024])
                .with_delay(Duration::from_millis(5)),
            RecordingEngine::default(),
            AccessPolicy::default(),
        );
        let query = format!("url={SOURCE}&op=grayscale&format=png");

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let use_case = Arc::clone(&h.use_case);
                let req = request(&query);
                tokio::spawn(async move {
                    let served = use_case.execute(req).await.unwrap();
                    (served.cache_status, collect_stream(served.body).await.unwrap())
                })
            })
            .collect();

        let mut bodies = Vec::new();
        for task in tasks {
            bodies.push(task.await.unwrap());
        }

        assert_eq!(h.upstream.fetches(), 1);
        assert_eq!(h.engine.renders.load(Ordering::SeqCst), 1);
        assert_eq!(bodies.iter().filter(|(s, _)| *s == CacheStatus::Miss).count(), 1);
        assert!(bodies.windows(2).all(|w| w[0].1 == w[1].1));
    }

    #[tokio::test]
    async fn test_cancelled_leader_still_serves_followers() {
        let h = harness_with(
            StaticUpstream::new()
                .with_body(SOURCE, vec![4_u8; 32 * 1024])
                .with_response_delay(Duration::from_millis(200)),
            RecordingEngine::default(),
            AccessPolicy::default(),
        );
        let query = format!("url={SOURCE}&op=flip&format=png");

        let leader = {
            let use_case = Arc::clone(&h.use_case);
            let req = request(&query);
            tokio::spawn(async move { use_case.execute(req).await.map(|_| ()) })
        };
        settle().await;
        let follower = {
            let use_case = Arc::clone(&h.use_case);
            let req = request(&query);
            tokio::spawn(async move {
                let served = use_case.execute(req).await?;
                let status = served.cache_status;
                let body = collect_stream(served.body)
                    .await
                    .map_err(|e| ProxyError::transform(e.to_string()))?;
                Ok::<_, ProxyError>((status, body))
            })
        };
        settle().await;
        leader.abort();

        let (status, body) = follower.await.unwrap().unwrap();
        assert_eq!(status, CacheStatus::Coalesced);
        assert_eq!(body.len(), 32 * 1024 + "flip".len());
        assert_eq!(h.upstream.fetches(), 1);
        assert_eq!(h.engine.renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_client_still_populates_cache() {
        let h = harness();
        let served = h.use_case.execute(request(&format!("url={SOURCE}&op=flop"))).await.unwrap();
        let key = served.cache_key.clone();
        drop(served);
        settle().await;

        assert!(h.storage.exists(&key).await);
        let again = h.use_case.execute(request(&format!("url={SOURCE}&op=flop"))).await.unwrap();
        assert_eq!(again.cache_status, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn test_expires_is_now_plus_max_age() {
        let h = harness();
        let served = h.use_case.execute(request(&format!("url={SOURCE}&format=jpeg"))).await.unwrap();

        assert_eq!(served.content_type, ImageFormat::Jpeg.content_type());
        let delta = served.expires - Utc::now();
        assert!(delta > chrono::Duration::hours(23) && delta <= chrono::Duration::hours(24));
    }
}
