//! Entry point of the SDK.

use std::sync::Arc;

use log::info;

use crate::config::SdkConfig;
use crate::context::Context;
use crate::crypto::{CryptoProvider, DefaultCrypto};
use crate::directory;
use crate::error::{Result, SdkError};
use crate::keygraph::KeyRing;
use crate::net::types::{GroupPublicKeyData, UserPublicKeyData};
use crate::net::Transport;
use crate::store::{KeyStore, MemoryKeyStore, StorageKey};
use crate::user::{LoginData, UserData, UserSession};

/// Client of one key server.
///
/// Holds the configuration and the collaborators every session shares.
///
/// # Example
///
/// ```ignore
/// use keyweave_core::{Client, SdkConfig};
///
/// let client = Client::with_defaults(SdkConfig::new(url, app_token), transport);
/// let mut user = client.restore_user("laptop", login_data).await?;
/// let group_id = user.create_group(false).await?;
/// let group = user.get_group(&group_id, None).await?;
/// let sealed = group.encrypt_string(&user, "hello", false)?;
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    ctx: Context,
}

impl Client {
    /// Creates a client from explicit collaborators.
    #[must_use]
    pub fn new(
        config: SdkConfig,
        store: Arc<dyn KeyStore>,
        transport: Arc<dyn Transport>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        Self {
            ctx: Context::new(config, store, transport, crypto),
        }
    }

    /// Creates a client with an in-memory store and [`DefaultCrypto`].
    #[must_use]
    pub fn with_defaults(config: SdkConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            config,
            Arc::new(MemoryKeyStore::new()),
            transport,
            Arc::new(DefaultCrypto::new()),
        )
    }

    /// Shared collaborators.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.ctx
    }

    // ==================== Users ====================

    /// Builds a session from the output of the login flow, stores it under
    /// `device_identifier` and makes it the actual user.
    ///
    /// The first user key generation in `login` is the newest one.
    ///
    /// # Errors
    ///
    /// - `SdkError::InvalidState` if `login` carries no user key
    /// - `SdkError::KeyNotFound` if a searchable key names an unknown
    ///   generation
    /// - crypto or store errors
    pub async fn restore_user(
        &self,
        device_identifier: &str,
        login: LoginData,
    ) -> Result<UserSession> {
        if login.user_keys.is_empty() {
            return Err(SdkError::InvalidState(format!(
                "login of user {} carries no user keys",
                login.user_id
            )));
        }
        let user_keys = KeyRing::from_server_order(login.user_keys);

        let mut hmac_keys = Vec::with_capacity(login.hmac_keys.len());
        for aux in &login.hmac_keys {
            let key = user_keys.get(&aux.group_key_id).ok_or_else(|| {
                SdkError::KeyNotFound(format!(
                    "user key generation {} of a searchable key",
                    aux.group_key_id
                ))
            })?;
            hmac_keys.push(self.ctx.crypto.decrypt_aux_key(&key.group_key, &aux.key_data)?);
        }

        let refresh_token = if self.ctx.config.stores_refresh_token() {
            login.refresh_token
        } else {
            String::new()
        };
        let data = UserData {
            user_id: login.user_id,
            device_id: login.device_id,
            jwt: login.jwt,
            refresh_token,
            mfa: login.mfa,
            device: login.device,
            user_keys,
            hmac_keys,
        };

        let session = UserSession::new(self.ctx.clone(), device_identifier, data);
        session.save().await?;
        self.ctx
            .save(&StorageKey::actual_user(), device_identifier)
            .await?;
        info!("restored user {} on {device_identifier}", session.user_id());
        Ok(session)
    }

    /// Session stored under `device_identifier`, if any.
    ///
    /// # Errors
    ///
    /// Returns store or decoding errors.
    pub async fn get_user(&self, device_identifier: &str) -> Result<Option<UserSession>> {
        let data: Option<UserData> = self
            .ctx
            .load(&StorageKey::user_data(device_identifier))
            .await?;
        Ok(data.map(|data| UserSession::new(self.ctx.clone(), device_identifier, data)))
    }

    /// Session of the actual user, if one is stored.
    ///
    /// # Errors
    ///
    /// Returns store or decoding errors.
    pub async fn actual_user(&self) -> Result<Option<UserSession>> {
        let device: Option<String> = self.ctx.load(&StorageKey::actual_user()).await?;
        match device {
            Some(device) => self.get_user(&device).await,
            None => Ok(None),
        }
    }

    // ==================== Directory ====================

    /// Newest public key of a user.
    ///
    /// # Errors
    ///
    /// Returns transport, server or store errors.
    pub async fn user_public_key(&self, user_id: &str) -> Result<UserPublicKeyData> {
        directory::user_public_key(&self.ctx, user_id).await
    }

    /// Verify key of one user key generation.
    ///
    /// # Errors
    ///
    /// Returns transport, server or store errors.
    pub async fn user_verify_key(&self, user_id: &str, key_id: &str) -> Result<String> {
        directory::user_verify_key(&self.ctx, user_id, key_id).await
    }

    /// Newest public key of a group.
    ///
    /// # Errors
    ///
    /// Returns transport, server or store errors.
    pub async fn group_public_key(&self, group_id: &str) -> Result<GroupPublicKeyData> {
        directory::group_public_key(&self.ctx, group_id).await
    }

    /// Checks the signature on a user's public key and remembers a positive
    /// result.
    ///
    /// # Errors
    ///
    /// Returns lookup or crypto errors.
    pub async fn verify_user_public_key(
        &self,
        user_id: &str,
        public_key: &UserPublicKeyData,
        force: bool,
    ) -> Result<bool> {
        directory::verify_user_public_key(&self.ctx, user_id, public_key, force).await
    }
}
