//! Standalone symmetric keys.
//!
//! A standalone key is wrapped by a user or group key generation (its
//! master key). Registered keys are stored by the key server and cached
//! locally; non-registered keys travel with the application's data as a
//! wrapped blob.

use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::context::{now_millis, Context};
use crate::crypto::CryptoProvider;
use crate::error::Result;
use crate::net::types::{SymKeyRegistered, SymKeyServerData};
use crate::net::HttpMethod;
use crate::store::StorageKey;

/// An unwrapped standalone key.
#[derive(Clone)]
pub struct SymKey {
    /// Server id; `None` for non-registered keys.
    pub key_id: Option<String>,
    /// Generation of the master key that wraps this key.
    pub master_key_id: String,
    /// Creation time (ms).
    pub time: u64,
    key: String,
    crypto: Arc<dyn CryptoProvider>,
}

impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymKey")
            .field("key_id", &self.key_id)
            .field("master_key_id", &self.master_key_id)
            .field("key", &"[REDACTED]")
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}

impl SymKey {
    /// Exported key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Encrypts bytes, optionally signing them.
    ///
    /// # Errors
    ///
    /// Returns crypto errors.
    pub fn encrypt(&self, data: &[u8], sign_key: Option<&str>) -> Result<Vec<u8>> {
        Ok(self.crypto.encrypt_symmetric(&self.key, data, sign_key)?)
    }

    /// Decrypts bytes, checking the signature if a verify key is given.
    ///
    /// # Errors
    ///
    /// Returns crypto errors.
    pub fn decrypt(&self, data: &[u8], verify_key: Option<&str>) -> Result<Vec<u8>> {
        Ok(self.crypto.decrypt_symmetric(&self.key, data, verify_key)?)
    }

    /// String form of [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns crypto errors.
    pub fn encrypt_string(&self, data: &str, sign_key: Option<&str>) -> Result<String> {
        Ok(self.crypto.encrypt_string_symmetric(&self.key, data, sign_key)?)
    }

    /// String form of [`decrypt`](Self::decrypt).
    ///
    /// # Errors
    ///
    /// Returns crypto errors.
    pub fn decrypt_string(&self, data: &str, verify_key: Option<&str>) -> Result<String> {
        Ok(self.crypto.decrypt_string_symmetric(&self.key, data, verify_key)?)
    }
}

/// Creates a key wrapped by `master_key` without registering it. Returns the
/// key and the wrapped blob to keep with the data.
pub(crate) fn generate_non_registered(
    ctx: &Context,
    master_key: &str,
    master_key_id: &str,
) -> Result<(SymKey, String)> {
    let (key, wrapped) = ctx.crypto.generate_non_registered_key(master_key)?;
    let sym_key = SymKey {
        key_id: None,
        master_key_id: master_key_id.to_string(),
        time: u64::try_from(now_millis()).unwrap_or_default(),
        key,
        crypto: Arc::clone(&ctx.crypto),
    };
    Ok((sym_key, wrapped))
}

/// Unwraps a blob created by [`generate_non_registered`].
pub(crate) fn decrypt_non_registered(
    ctx: &Context,
    master_key: &str,
    master_key_id: &str,
    wrapped: &str,
) -> Result<SymKey> {
    Ok(SymKey {
        key_id: None,
        master_key_id: master_key_id.to_string(),
        time: 0,
        key: ctx.crypto.decrypt_non_registered_key(master_key, wrapped)?,
        crypto: Arc::clone(&ctx.crypto),
    })
}

/// Registers a new key wrapped by `master_key` and returns its server record.
pub(crate) async fn register(ctx: &Context, jwt: String, master_key: &str) -> Result<SymKeyServerData> {
    let body = ctx.crypto.prepare_register_sym_key(master_key)?;
    let registered: SymKeyRegistered = ctx
        .call(
            ctx.request(HttpMethod::Post, "api/v1/keys/sym_key")
                .with_body(body)
                .with_jwt(jwt.clone()),
        )
        .await?;
    debug!("registered sym key {}", registered.key_id);
    fetch(ctx, jwt, &registered.key_id).await
}

/// Server record of a registered key, from the cache or the key server.
pub(crate) async fn fetch(ctx: &Context, jwt: String, key_id: &str) -> Result<SymKeyServerData> {
    let store_key = StorageKey::sym_key(key_id);
    if let Some(cached) = ctx.load(&store_key).await? {
        return Ok(cached);
    }

    let data: SymKeyServerData = ctx
        .call(
            ctx.request(HttpMethod::Get, &format!("api/v1/keys/sym_key/{key_id}"))
                .with_jwt(jwt),
        )
        .await?;
    ctx.save(&store_key, &data).await?;
    Ok(data)
}

/// Unwraps a registered key with the master key named by the record.
pub(crate) fn open(ctx: &Context, master_key: &str, data: &SymKeyServerData) -> Result<SymKey> {
    Ok(SymKey {
        key_id: Some(data.key_id.clone()),
        master_key_id: data.master_key_id.clone(),
        time: data.time,
        key: ctx.crypto.decrypt_sym_key(master_key, data)?,
        crypto: Arc::clone(&ctx.crypto),
    })
}

/// Deletes a registered key on the server and from the cache.
pub(crate) async fn delete(ctx: &Context, jwt: String, key_id: &str) -> Result<()> {
    ctx.call_general(
        ctx.request(HttpMethod::Delete, &format!("api/v1/keys/sym_key/{key_id}"))
            .with_jwt(jwt),
    )
    .await?;
    ctx.remove(&StorageKey::sym_key(key_id)).await
}
