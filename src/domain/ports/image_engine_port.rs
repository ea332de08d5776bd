//! Port for the pixel-level image engine.

use std::collections::HashMap;

use crate::domain::entities::PipelineSpec;
use crate::domain::errors::EngineError;

/// Decoded secondary inputs keyed by source URL.
pub type OperandImages = HashMap<String, Vec<u8>>;

/// Executes a validated pipeline on encoded bytes.
///
/// Calls are CPU-bound and blocking; callers run them off the async
/// executor.
#[cfg_attr(test, mockall::automock)]
pub trait ImageEnginePort: Send + Sync {
    /// Decodes `source`, applies every stage of `spec` in order and encodes
    /// the result.
    ///
    /// # Errors
    /// Returns an [`EngineError`] on decode, parameter or encode failure.
    fn render(
        &self,
        spec: &PipelineSpec,
        source: &[u8],
        operands: &OperandImages,
    ) -> Result<Vec<u8>, EngineError>;
}
