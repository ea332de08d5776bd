//! Domain layer with core value objects, policies and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;
/// Pure domain services.
pub mod services;

pub use entities::{CacheKey, RequestDescriptor};
pub use errors::ProxyError;
pub use ports::{ImageEnginePort, StoragePort, UpstreamPort};
