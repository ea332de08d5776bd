//! Upstream fetch error types.

use thiserror::Error;

/// Failure reaching or reading a source image.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("upstream {url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("response body exceeded the maximum of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("failed to read response body: {message}")]
    Body { message: String },
}

impl FetchError {
    /// Creates request error.
    #[must_use]
    pub fn request(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Request {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates body error.
    #[must_use]
    pub fn body(message: impl Into<String>) -> Self {
        Self::Body {
            message: message.into(),
        }
    }
}
