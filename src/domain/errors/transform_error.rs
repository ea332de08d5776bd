//! Pipeline construction and codec error types.

use thiserror::Error;

/// Raised while translating a descriptor into a pipeline, before any I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum PipelineError {
    #[error("unsupported operation `{name}`")]
    UnsupportedOperation { name: String },

    #[error("invalid parameter for `{operation}`: {message}")]
    InvalidParameter { operation: String, message: String },
}

impl PipelineError {
    /// Creates unsupported operation error.
    #[must_use]
    pub fn unsupported(name: impl Into<String>) -> Self {
        Self::UnsupportedOperation { name: name.into() }
    }

    /// Creates invalid parameter error.
    #[must_use]
    pub fn invalid(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Raised by the image engine while executing a pipeline.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum EngineError {
    #[error("failed to decode source image: {0}")]
    Decode(String),

    #[error("failed to encode output image: {0}")]
    Encode(String),

    #[error("not supported by the image engine: {0}")]
    Unsupported(String),

    #[error("invalid operation input: {0}")]
    InvalidInput(String),
}
