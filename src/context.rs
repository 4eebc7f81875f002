//! Collaborators shared by every session.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::SdkConfig;
use crate::crypto::CryptoProvider;
use crate::error::Result;
use crate::net::{handle_general_server_response, handle_server_response, HttpMethod, Request, Transport};
use crate::store::{KeyStore, StorageKey};

/// Configuration plus the store, transport and primitive provider.
///
/// Cloning is cheap; sessions each hold their own copy.
#[derive(Clone)]
pub struct Context {
    /// Client configuration.
    pub config: SdkConfig,
    /// Local key store.
    pub store: Arc<dyn KeyStore>,
    /// HTTP transport.
    pub transport: Arc<dyn Transport>,
    /// Primitive crypto provider.
    pub crypto: Arc<dyn CryptoProvider>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Bundles the collaborators.
    #[must_use]
    pub fn new(
        config: SdkConfig,
        store: Arc<dyn KeyStore>,
        transport: Arc<dyn Transport>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            crypto,
        }
    }

    // ==================== Requests ====================

    /// Starts a request against `path` on the key server.
    #[must_use]
    pub fn request(&self, method: HttpMethod, path: &str) -> Request {
        Request::new(method, self.config.url(path), self.config.app_token.clone())
    }

    /// Sends a request and returns the raw response text.
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub async fn send(&self, request: Request) -> Result<String> {
        log::debug!("{} {}", request.method, request.url);
        self.transport.make_req(request).await
    }

    /// Sends a request and decodes the typed result of the envelope.
    ///
    /// # Errors
    ///
    /// Returns transport, server or envelope errors.
    pub async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        handle_server_response(&self.send(request).await?)
    }

    /// Sends a request whose result is not needed.
    ///
    /// # Errors
    ///
    /// Returns transport, server or envelope errors.
    pub async fn call_general(&self, request: Request) -> Result<()> {
        handle_general_server_response(&self.send(request).await?)
    }

    // ==================== Store ====================

    /// Loads and decodes a stored record.
    ///
    /// # Errors
    ///
    /// Returns store or decoding errors.
    pub async fn load<T: DeserializeOwned>(&self, key: &StorageKey) -> Result<Option<T>> {
        match self.store.get(key.as_str()).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encodes and stores a record.
    ///
    /// # Errors
    ///
    /// Returns store or encoding errors.
    pub async fn save<T: Serialize + ?Sized>(&self, key: &StorageKey, value: &T) -> Result<()> {
        self.store.set(key.as_str(), serde_json::to_vec(value)?).await
    }

    /// Deletes a stored record.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn remove(&self, key: &StorageKey) -> Result<()> {
        self.store.delete(key.as_str()).await
    }
}

/// Current time in unix milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
