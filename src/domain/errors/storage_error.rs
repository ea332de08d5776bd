//! Storage backend error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage error variants.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum StorageError {
    /// Key is not present in the store.
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// Local I/O failure.
    #[error("storage io error: {message}")]
    Io { message: String },

    /// Remote object store failure.
    #[error("object store error: {message}")]
    Backend { message: String },

    /// Backend unreachable or misconfigured at boot.
    #[error("storage initialization failed: {message}")]
    Init { message: String },
}

impl StorageError {
    /// Creates not found error.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates io error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates backend error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates init error.
    #[must_use]
    pub fn init(message: impl Into<String>) -> Self {
        Self::Init {
            message: message.into(),
        }
    }

    /// Returns whether the error signals a missing key.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
