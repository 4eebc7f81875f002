//! User key data model.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keygraph::{KeyRing, VersionedKey};
use crate::net::types::FetchedAuxKey;

/// One generation of a user's device independent keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct UserKey {
    /// Generation id.
    pub group_key_id: String,
    /// Exported symmetric key.
    pub group_key: String,
    /// Exported private key.
    pub private_key: String,
    /// Exported public key.
    pub public_key: String,
    /// Exported sign key.
    pub sign_key: String,
    /// Exported verify key.
    pub verify_key: String,
    /// Signed public key as published by the key server.
    pub exported_public_key: String,
    /// Verify key as published by the key server.
    pub exported_verify_key: String,
    /// Creation time (ms).
    pub time: u64,
}

impl VersionedKey for UserKey {
    fn key_id(&self) -> &str {
        &self.group_key_id
    }

    fn created_at(&self) -> u64 {
        self.time
    }
}

impl fmt::Debug for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserKey")
            .field("group_key_id", &self.group_key_id)
            .field("group_key", &"[REDACTED]")
            .field("private_key", &"[REDACTED]")
            .field("sign_key", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}

/// Keys bound to one device. They only wrap the user keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DeviceKeys {
    /// Exported private key.
    pub private_key: String,
    /// Exported public key.
    pub public_key: String,
    /// Exported sign key.
    pub sign_key: String,
    /// Exported verify key.
    pub verify_key: String,
    /// Public key as published by the key server.
    pub exported_public_key: String,
    /// Verify key as published by the key server.
    pub exported_verify_key: String,
}

impl fmt::Debug for DeviceKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKeys")
            .field("private_key", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .field("sign_key", &"[REDACTED]")
            .field("verify_key", &self.verify_key)
            .finish_non_exhaustive()
    }
}

/// Output of the external login flow a session is built from.
#[derive(Clone, Serialize, Deserialize)]
pub struct LoginData {
    /// User id.
    pub user_id: String,
    /// Device id.
    pub device_id: String,
    /// Session JWT.
    pub jwt: String,
    /// Refresh token.
    pub refresh_token: String,
    /// Multi factor auth is enabled for the account.
    pub mfa: bool,
    /// Device keys.
    pub device: DeviceKeys,
    /// Decrypted user key generations, newest first.
    pub user_keys: Vec<UserKey>,
    /// Searchable encryption keys of the user, wrapped with user keys.
    #[serde(default)]
    pub hmac_keys: Vec<FetchedAuxKey>,
}

impl fmt::Debug for LoginData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginData")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("user_keys", &self.user_keys.len())
            .finish_non_exhaustive()
    }
}

/// Stored session state of a user on one device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    /// User id.
    pub user_id: String,
    /// Device id.
    pub device_id: String,
    /// Session JWT.
    pub jwt: String,
    /// Refresh token; empty when refresh is handled by the application.
    pub refresh_token: String,
    /// Multi factor auth is enabled for the account.
    pub mfa: bool,
    /// Device keys.
    pub device: DeviceKeys,
    /// User key generations.
    pub user_keys: KeyRing<UserKey>,
    /// Searchable encryption keys, newest first.
    pub hmac_keys: Vec<String>,
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("mfa", &self.mfa)
            .field("user_keys", &self.user_keys.len())
            .field("newest_key_id", &self.user_keys.newest_key_id())
            .finish_non_exhaustive()
    }
}
