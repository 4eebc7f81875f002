//! Names of stored records.

use std::fmt;

/// Key of a record in the [`KeyStore`](super::KeyStore).
///
/// Keys are `"<namespace>_user_<user_id>_id_<id>"` for per-owner records and
/// `"<namespace>_id_<id>"` for global ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    /// Session state of the user logged in on `device_identifier`.
    #[must_use]
    pub fn user_data(device_identifier: &str) -> Self {
        Self(format!("user_data_id_{device_identifier}"))
    }

    /// Pointer to the device identifier of the actual user.
    #[must_use]
    pub fn actual_user() -> Self {
        Self("actual_user".to_string())
    }

    /// Cached public key of a user.
    #[must_use]
    pub fn user_public_key(user_id: &str) -> Self {
        Self(format!("user_public_key_id_{user_id}"))
    }

    /// Cached verify key of a user key generation.
    #[must_use]
    pub fn user_verify_key(user_id: &str, key_id: &str) -> Self {
        Self(format!("user_verify_key_id_{user_id}_key_id_{key_id}"))
    }

    /// Group snapshot of `group_id` as seen by `owner_id` (a user or a
    /// connected group acting as member).
    #[must_use]
    pub fn group_data(owner_id: &str, group_id: &str) -> Self {
        Self(format!("group_data_user_{owner_id}_id_{group_id}"))
    }

    /// Cached newest public key of a group.
    #[must_use]
    pub fn group_public_key(group_id: &str) -> Self {
        Self(format!("group_public_key_id_{group_id}"))
    }

    /// Cached registered symmetric key.
    #[must_use]
    pub fn sym_key(key_id: &str) -> Self {
        Self(format!("sym_key_id_{key_id}"))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
