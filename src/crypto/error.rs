//! Error types for primitive crypto operations.

use thiserror::Error;

/// Errors raised by a [`CryptoProvider`](super::CryptoProvider).
#[derive(Error, Debug)]
pub enum CryptoError {
    /// A key string could not be parsed or has the wrong algorithm.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Encryption failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed (wrong key or tampered data).
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// A signature was missing or did not verify.
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Input outside of what the operation accepts.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Base64 or framing error.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for crypto operations.
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Encoding(e.to_string())
    }
}
