//! Per-request error taxonomy.

use thiserror::Error;

use super::{EngineError, FetchError, PipelineError, StorageError, ValidationError};

/// Everything that can end a request early. Cloneable so one failure can be
/// handed to every request waiting on the same in-flight computation.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// Malformed, missing or disallowed parameters.
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// Source domain or requesting origin not allowed.
    #[error("forbidden: {reason}")]
    Forbidden {
        /// Which policy rejected the request.
        reason: String,
    },

    /// The source image could not be fetched.
    #[error("upstream fetch failed: {message}")]
    UpstreamFetch {
        /// Failure description.
        message: String,
    },

    /// The descriptor could not be turned into a pipeline.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The image engine failed while running the pipeline.
    #[error("transform failed: {message}")]
    Transform {
        /// Failure description.
        message: String,
    },

    /// Storage backend failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ProxyError {
    /// Creates forbidden error.
    #[must_use]
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    /// Creates upstream fetch error.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamFetch {
            message: message.into(),
        }
    }

    /// Creates transform error.
    #[must_use]
    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform {
            message: message.into(),
        }
    }

    /// Short machine-readable kind, used in error bodies and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Forbidden { .. } => "forbidden",
            Self::UpstreamFetch { .. } => "upstream_fetch",
            Self::Pipeline(_) => "pipeline",
            Self::Transform { .. } => "transform",
            Self::Storage(_) => "storage",
        }
    }

    /// Returns whether the client caused the error.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Forbidden { .. } | Self::Pipeline(_)
        )
    }
}

impl From<FetchError> for ProxyError {
    fn from(err: FetchError) -> Self {
        Self::upstream(err.to_string())
    }
}

impl From<EngineError> for ProxyError {
    fn from(err: EngineError) -> Self {
        Self::transform(err.to_string())
    }
}
