//! Primitive crypto provider seam.
//!
//! Everything that touches key bytes lives behind [`CryptoProvider`]. The
//! rest of the crate only moves opaque strings around: exported keys, server
//! blobs and ciphertexts. [`DefaultCrypto`] is a complete provider built on
//! X25519, XChaCha20-Poly1305, Ed25519 and HMAC-SHA256.
//!
//! # Architecture
//!
//! ```text
//! KeyGraphResolver / RotationCoordinator / sessions
//!     │  exported keys + server blobs (strings)
//!     ▼
//! Arc<dyn CryptoProvider>
//!     └── DefaultCrypto
//!             ├── wire   (records exchanged with the key server)
//!             └── search (HMAC search tokens, order preserving encoding)
//! ```
//!
//! Every operation is synchronous and pure.

mod default;
mod error;
pub mod search;
pub mod wire;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::keygraph::GroupKey;
use crate::net::types::SymKeyServerData;
use crate::user::UserKey;

pub use default::DefaultCrypto;
pub use error::{CryptoError, CryptoResult};

/// Signature part of a ciphertext head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignHead {
    /// Id of the sign key generation (the signer's user key id).
    pub id: String,
    /// Signature algorithm.
    pub alg: String,
}

/// Head of a ciphertext: which key decrypts it and who signed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedHead {
    /// Id of the key that decrypts the payload.
    pub id: String,
    /// Present if the payload was signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<SignHead>,
}

/// Claims of a session JWT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// User id.
    pub sub: String,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Device id.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Primitive operations the SDK delegates key handling to.
///
/// Keys are exchanged as exported strings that carry their own key id.
/// Server blobs are opaque to the caller.
pub trait CryptoProvider: Send + Sync {
    // ==================== Key Unwrapping ====================

    /// Unwraps one group key generation with the private key named by the
    /// copy's `private_key_id`. With a verify key, the generation's signature
    /// is checked first.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be unwrapped or does not verify.
    fn decrypt_group_key(
        &self,
        private_key: &str,
        key_data: &str,
        verify_key: Option<&str>,
    ) -> CryptoResult<GroupKey>;

    /// Unwraps one user key generation with the device private key.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be unwrapped.
    fn decrypt_user_key(&self, device_private_key: &str, key_data: &str) -> CryptoResult<UserKey>;

    /// Unwraps a searchable or sortable key with the group key that wraps it.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be unwrapped.
    fn decrypt_aux_key(&self, group_key: &str, key_data: &str) -> CryptoResult<String>;

    // ==================== Group Lifecycle ====================

    /// Builds the body of a group creation. The first key generation is
    /// wrapped for `creator_public_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is invalid.
    fn prepare_create_group(
        &self,
        creator_public_key: &str,
        sign_key: Option<&str>,
        starter: &str,
    ) -> CryptoResult<String>;

    /// Wraps a page of group keys for a new member.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is invalid.
    fn prepare_keys_for_new_member(
        &self,
        member_public_key: &str,
        group_keys: &[&str],
        key_count: usize,
        rank: Option<i32>,
    ) -> CryptoResult<String>;

    // ==================== Rotation ====================

    /// Builds the body of a group key rotation. The new generation is wrapped
    /// for the invoker and an ephemeral key is wrapped with the previous key
    /// for every other member.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is invalid.
    fn prepare_key_rotation(
        &self,
        pre_group_key: &str,
        invoker_public_key: &str,
        sign_key: Option<&str>,
        starter: &str,
    ) -> CryptoResult<String>;

    /// Builds the body of a user key rotation. Like a group rotation, plus a
    /// fresh sign/verify pair.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is invalid.
    fn prepare_user_key_rotation(
        &self,
        pre_user_key: &str,
        device_public_key: &str,
    ) -> CryptoResult<String>;

    /// Unwraps a rotation record and re-wraps the new generation for
    /// `public_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be unwrapped with `private_key`
    /// and `pre_group_key`.
    fn done_key_rotation(
        &self,
        server_output: &str,
        pre_group_key: &str,
        public_key: &str,
        private_key: &str,
    ) -> CryptoResult<String>;

    // ==================== Payloads ====================

    /// Reads the head of a binary ciphertext.
    ///
    /// # Errors
    ///
    /// Returns an error if the framing is invalid.
    fn split_head(&self, data: &[u8]) -> CryptoResult<EncryptedHead>;

    /// Encrypts with a symmetric key, optionally signing the ciphertext.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is invalid.
    fn encrypt_symmetric(
        &self,
        key: &str,
        data: &[u8],
        sign_key: Option<&str>,
    ) -> CryptoResult<Vec<u8>>;

    /// Decrypts with a symmetric key, verifying the signature if a verify key
    /// is given.
    ///
    /// # Errors
    ///
    /// Returns an error if decryption or verification fails.
    fn decrypt_symmetric(
        &self,
        key: &str,
        data: &[u8],
        verify_key: Option<&str>,
    ) -> CryptoResult<Vec<u8>>;

    /// Encrypts for the holder of the matching private key.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is invalid.
    fn encrypt_asymmetric(
        &self,
        public_key: &str,
        data: &[u8],
        sign_key: Option<&str>,
    ) -> CryptoResult<Vec<u8>>;

    /// Decrypts with a private key.
    ///
    /// # Errors
    ///
    /// Returns an error if decryption or verification fails.
    fn decrypt_asymmetric(
        &self,
        private_key: &str,
        data: &[u8],
        verify_key: Option<&str>,
    ) -> CryptoResult<Vec<u8>>;

    /// Checks the signature on an exported user public key.
    ///
    /// # Errors
    ///
    /// Returns an error if a key cannot be parsed.
    fn verify_user_public_key(&self, verify_key: &str, public_key: &str) -> CryptoResult<bool>;

    /// Fingerprint two users compare out of band to confirm each other's
    /// verify keys. Both pairs are `(user_id, verify_key)`; the result does
    /// not depend on their order. Without `other` it fingerprints `own`
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns an error if a verify key cannot be parsed.
    fn create_safety_number(
        &self,
        own: (&str, &str),
        other: Option<(&str, &str)>,
    ) -> CryptoResult<String>;

    // ==================== Standalone Keys ====================

    /// Creates a symmetric key wrapped by `master_key` that is never
    /// registered on the server. Returns `(key, wrapped_key)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the master key is invalid.
    fn generate_non_registered_key(&self, master_key: &str) -> CryptoResult<(String, String)>;

    /// Unwraps a key created by [`generate_non_registered_key`](Self::generate_non_registered_key).
    ///
    /// # Errors
    ///
    /// Returns an error if unwrapping fails.
    fn decrypt_non_registered_key(&self, master_key: &str, wrapped_key: &str)
        -> CryptoResult<String>;

    /// Builds the body registering a new symmetric key wrapped by `master_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the master key is invalid.
    fn prepare_register_sym_key(&self, master_key: &str) -> CryptoResult<String>;

    /// Unwraps a registered symmetric key.
    ///
    /// # Errors
    ///
    /// Returns an error if unwrapping fails.
    fn decrypt_sym_key(&self, master_key: &str, data: &SymKeyServerData) -> CryptoResult<String>;

    // ==================== Searchable and Sortable ====================

    /// Creates search tokens for `data`: one for the full value, or one per
    /// prefix (capped at `limit`).
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or `data` is empty or too long.
    fn create_searchable(
        &self,
        hmac_key: &str,
        data: &str,
        full: bool,
        limit: Option<usize>,
    ) -> CryptoResult<Vec<String>>;

    /// Creates the token to search for `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or `data` is empty.
    fn search(&self, hmac_key: &str, data: &str) -> CryptoResult<String>;

    /// Order preserving encoding of a number.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the number is out of range.
    fn sortable_encrypt_number(&self, key: &str, number: u64) -> CryptoResult<u64>;

    /// Order preserving encoding of the leading bytes of a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid.
    fn sortable_encrypt_string(&self, key: &str, data: &str) -> CryptoResult<u64>;

    // ==================== Session ====================

    /// Decodes the claims of a JWT without checking its signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed.
    fn decode_jwt(&self, jwt: &str) -> CryptoResult<JwtClaims>;

    // ==================== String Forms ====================

    /// Reads the head of a base64 ciphertext.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoding or framing is invalid.
    fn split_head_string(&self, data: &str) -> CryptoResult<EncryptedHead> {
        self.split_head(&STANDARD.decode(data)?)
    }

    /// String form of [`encrypt_symmetric`](Self::encrypt_symmetric).
    ///
    /// # Errors
    ///
    /// Returns an error if a key is invalid.
    fn encrypt_string_symmetric(
        &self,
        key: &str,
        data: &str,
        sign_key: Option<&str>,
    ) -> CryptoResult<String> {
        Ok(STANDARD.encode(self.encrypt_symmetric(key, data.as_bytes(), sign_key)?))
    }

    /// String form of [`decrypt_symmetric`](Self::decrypt_symmetric).
    ///
    /// # Errors
    ///
    /// Returns an error if decryption fails or the plaintext is not UTF-8.
    fn decrypt_string_symmetric(
        &self,
        key: &str,
        data: &str,
        verify_key: Option<&str>,
    ) -> CryptoResult<String> {
        let plain = self.decrypt_symmetric(key, &STANDARD.decode(data)?, verify_key)?;
        String::from_utf8(plain).map_err(|e| CryptoError::Decryption(e.to_string()))
    }

    /// String form of [`encrypt_asymmetric`](Self::encrypt_asymmetric).
    ///
    /// # Errors
    ///
    /// Returns an error if a key is invalid.
    fn encrypt_string_asymmetric(
        &self,
        public_key: &str,
        data: &str,
        sign_key: Option<&str>,
    ) -> CryptoResult<String> {
        Ok(STANDARD.encode(self.encrypt_asymmetric(public_key, data.as_bytes(), sign_key)?))
    }

    /// String form of [`decrypt_asymmetric`](Self::decrypt_asymmetric).
    ///
    /// # Errors
    ///
    /// Returns an error if decryption fails or the plaintext is not UTF-8.
    fn decrypt_string_asymmetric(
        &self,
        private_key: &str,
        data: &str,
        verify_key: Option<&str>,
    ) -> CryptoResult<String> {
        let plain = self.decrypt_asymmetric(private_key, &STANDARD.decode(data)?, verify_key)?;
        String::from_utf8(plain).map_err(|e| CryptoError::Decryption(e.to_string()))
    }
}
