//! Error types for the crypto layer.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur while decrypting a feed payload.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The armored payload could not be decrypted with the given identity.
    #[error("{0}")]
    Decrypt(String),

    /// Decryption succeeded but the plaintext is not valid UTF-8.
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}
