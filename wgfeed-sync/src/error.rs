//! Error types for the sync layer.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Protocol error (server answered outside the wg-feed contract).
    #[error("{0}")]
    Protocol(String),

    /// Validation failure in an envelope or document.
    #[error("{0}")]
    Validation(#[from] wgfeed_types::ValidationError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store error.
    #[error("store error: {0}")]
    Store(String),

    /// Subscription row disappeared mid-operation.
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(i64),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}
