//! Port definitions (traits) implemented by infrastructure adapters.

mod image_engine_port;
mod storage_port;
mod upstream_port;

#[cfg(test)]
pub use image_engine_port::MockImageEnginePort;
pub use image_engine_port::{ImageEnginePort, OperandImages};
pub use storage_port::{BlobWriter, ByteStream, StoragePort};
pub use upstream_port::UpstreamPort;

#[cfg(test)]
pub mod mocks {
    pub use super::storage_port::mock::MemoryStorage;
    pub use super::upstream_port::mock::StaticUpstream;
}
