//! Domain error types.

mod fetch_error;
mod proxy_error;
mod storage_error;
mod transform_error;
mod validation_error;

pub use fetch_error::FetchError;
pub use proxy_error::ProxyError;
pub use storage_error::{StorageError, StorageResult};
pub use transform_error::{EngineError, PipelineError};
pub use validation_error::ValidationError;
