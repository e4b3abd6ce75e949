//! Validation error type.

use thiserror::Error;

/// Result type for validation checks.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// A structural or semantic violation in a wg-feed envelope or document.
///
/// Carries a human-readable reason. Callers decide retriability; a
/// validation failure by itself is not terminal (decrypt-class failures
/// are classified separately in `wgfeed-sync`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Envelope version is not the supported protocol version.
    #[error("Unsupported wg-feed version: {0}")]
    UnsupportedVersion(String),

    /// Any other schema violation, with the reason.
    #[error("{0}")]
    Schema(String),
}

impl ValidationError {
    pub(crate) fn schema(reason: impl Into<String>) -> Self {
        Self::Schema(reason.into())
    }
}
