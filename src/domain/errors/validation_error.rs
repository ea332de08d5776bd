//! Request validation errors.

use thiserror::Error;

/// One or more violated request constraints.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .violations.join(", "))]
pub struct ValidationError {
    violations: Vec<String>,
}

impl ValidationError {
    /// Creates an error from a non-empty list of violations.
    #[must_use]
    pub const fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }

    /// Creates an error with a single violation.
    #[must_use]
    pub fn single(violation: impl Into<String>) -> Self {
        Self {
            violations: vec![violation.into()],
        }
    }

    /// Returns every violated constraint.
    #[must_use]
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// Returns true if any violation mentions the given text.
    #[must_use]
    pub fn mentions(&self, needle: &str) -> bool {
        self.violations.iter().any(|v| v.contains(needle))
    }
}
