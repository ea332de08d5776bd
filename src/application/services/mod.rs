//! Application services.

mod origin_fetcher;
mod single_flight;
mod stream_fanout;
mod transform_pipeline;

pub use origin_fetcher::{DEFAULT_CHANNEL_CAPACITY, OriginFetcher};
pub use single_flight::{Flight, FlightGuard, FlightWaiter, SingleFlight};
pub use stream_fanout::{
    ChannelSink, FanoutReport, FanoutSink, SinkFailure, StorageSink, channel_sink, collect_stream,
    fanout,
};
pub use transform_pipeline::{OUTPUT_CHUNK_SIZE, TransformPipeline};
