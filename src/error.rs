//! Error types shared by every layer of the SDK.
//!
//! Errors keep the wire-style tags the key server and the client use to talk
//! about failures (`server_<code>`, `client_<code>`), so callers can match on
//! [`SdkError::status`] without caring which layer produced the error.

use thiserror::Error;

use crate::crypto::CryptoError;

/// Request could not be sent.
pub const TRANSPORT_SEND_FAILED: u32 = 1000;
/// Response body could not be read as text.
pub const TRANSPORT_BODY_UNREADABLE: u32 = 1002;
/// Envelope is malformed or misses its result.
pub const CLIENT_MALFORMED_RESPONSE: u32 = 101;
/// The local rank is too low for the requested group action.
pub const CLIENT_NO_RANK: u32 = 201;
/// The refresh endpoint asked for a second factor.
pub const CLIENT_MFA_REQUIRED: u32 = 10_000;

/// The server does not know the requested identity.
pub const SERVER_IDENTITY_NOT_FOUND: u32 = 100;
/// The server has no key copy this principal can decrypt.
pub const SERVER_KEY_NOT_DECRYPTABLE: u32 = 304;
/// The principal has no access to the group.
pub const SERVER_NO_GROUP_ACCESS: u32 = 310;

/// Error type for SDK operations.
#[derive(Error, Debug)]
pub enum SdkError {
    /// The transport failed before a response text was available.
    #[error("Transport error client_{code}: {message}")]
    Transport {
        /// Client code (`1000` send failed, `1002` body unreadable).
        code: u32,
        /// Transport supplied detail.
        message: String,
    },

    /// The server answered with `status = false`.
    #[error("Server error server_{code}: {message}")]
    Server {
        /// Server error code.
        code: u32,
        /// Server error message.
        message: String,
    },

    /// A local precondition failed.
    #[error("Client error client_{code}: {message}")]
    Client {
        /// Client error code.
        code: u32,
        /// Detail.
        message: String,
    },

    /// A key is still missing after a remote fetch attempt.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// A parent or connected group needed to unwrap keys is not stored locally.
    #[error("Broken access chain: {0}")]
    BrokenAccessChain(String),

    /// Local state violates an invariant.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Key store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The primitive provider rejected an operation.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;

impl SdkError {
    /// Builds a server error.
    pub fn server(code: u32, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            message: message.into(),
        }
    }

    /// Builds a client error.
    pub fn client(code: u32, message: impl Into<String>) -> Self {
        Self::Client {
            code,
            message: message.into(),
        }
    }

    /// Builds the rank error raised before destructive group actions.
    pub fn no_rank() -> Self {
        Self::client(CLIENT_NO_RANK, "No rights to do this action")
    }

    /// Builds the error for a malformed server envelope.
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::client(CLIENT_MALFORMED_RESPONSE, detail)
    }

    /// Returns the wire-style status tag of this error.
    ///
    /// # Example
    ///
    /// ```
    /// use keyweave_core::SdkError;
    ///
    /// let err = SdkError::server(304, "key not found");
    /// assert_eq!(err.status(), "server_304");
    /// ```
    #[must_use]
    pub fn status(&self) -> String {
        match self {
            Self::Transport { code, .. } | Self::Client { code, .. } => format!("client_{code}"),
            Self::Server { code, .. } => format!("server_{code}"),
            Self::KeyNotFound(_) => "key_not_found".to_string(),
            Self::BrokenAccessChain(_) => "broken_access_chain".to_string(),
            Self::InvalidState(_) => "invalid_state".to_string(),
            Self::Storage(_) => "storage".to_string(),
            Self::Serialization(_) => "serialization".to_string(),
            Self::Crypto(_) => "crypto".to_string(),
        }
    }

    /// Returns true if this is a server error with the given code.
    #[must_use]
    pub const fn is_server_code(&self, expected: u32) -> bool {
        matches!(self, Self::Server { code, .. } if *code == expected)
    }
}
