//! Content-derived storage keys.

use sha3::{Digest, Sha3_256};

/// Key of a stored blob: the hex-encoded SHA3-256 digest of some canonical
/// input. Original bytes are keyed by their source URL, derived variants by
/// the canonical request string; both share one keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hashes the input into a key.
    #[must_use]
    pub fn digest(input: &str) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(input.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps an already computed hex key.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
