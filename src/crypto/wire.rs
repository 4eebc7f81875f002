//! Records [`DefaultCrypto`](super::DefaultCrypto) exchanges with the key
//! server.
//!
//! The client produces the `*Input` records, the server stores their fields
//! and assembles the `*Data`/`*Output` records it hands back. Binary fields
//! are standard base64.

use serde::{Deserialize, Serialize};

/// An exported key: `{key_id, alg, key}` with an optional signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedKey {
    /// Key generation id.
    pub key_id: String,
    /// Algorithm tag.
    pub alg: String,
    /// Key bytes.
    pub key: String,
    /// Signature over the key bytes (exported user public keys only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl std::fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedKey")
            .field("key_id", &self.key_id)
            .field("alg", &self.alg)
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Body of a group creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroupInput {
    /// First group key wrapped for the creator.
    pub encrypted_group_key: String,
    /// Public key the first group key is wrapped with.
    pub creator_public_key_id: String,
    /// Group private key sealed with the group key.
    pub encrypted_private_group_key: String,
    /// Group public key.
    pub public_group_key: String,
    /// Searchable encryption key sealed with the group key.
    pub encrypted_hmac_key: String,
    /// Sortable encryption key sealed with the group key.
    pub encrypted_sortable_key: String,
    /// Signer of the key generation.
    #[serde(default)]
    pub signed_by_user_id: Option<String>,
    /// Sign key generation of the signer.
    #[serde(default)]
    pub signed_by_user_sign_key_id: Option<String>,
    /// Signature over the sealed private key and the public key.
    #[serde(default)]
    pub group_key_sig: Option<String>,
}

/// One key generation as delivered to one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKeyData {
    /// Key generation id.
    pub group_key_id: String,
    /// Creation time (ms).
    pub time: u64,
    /// Group key wrapped for the member.
    pub encrypted_group_key: String,
    /// Group private key sealed with the group key.
    pub encrypted_private_group_key: String,
    /// Group public key.
    pub public_group_key: String,
    /// Signature of the generation.
    #[serde(default)]
    pub group_key_sig: Option<String>,
}

/// Body of a group or user key rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRotationInput {
    /// Generation the ephemeral key is sealed with.
    pub previous_group_key_id: String,
    /// Public key the new generation is wrapped with for the invoker.
    pub invoker_public_key_id: String,
    /// New key wrapped for the invoker.
    pub encrypted_group_key_by_user: String,
    /// Ephemeral key sealed with the previous key.
    pub encrypted_ephemeral_key: String,
    /// New key sealed with the ephemeral key.
    pub encrypted_group_key_by_ephemeral: String,
    /// New private key sealed with the new key.
    pub encrypted_private_group_key: String,
    /// New public key.
    pub public_group_key: String,
    /// Signer of the generation.
    #[serde(default)]
    pub signed_by_user_id: Option<String>,
    /// Sign key generation of the signer.
    #[serde(default)]
    pub signed_by_user_sign_key_id: Option<String>,
    /// Signature over the sealed private key and the public key.
    #[serde(default)]
    pub group_key_sig: Option<String>,
    /// New sign key sealed with the new key (user rotations).
    #[serde(default)]
    pub encrypted_sign_key: Option<String>,
    /// New verify key (user rotations).
    #[serde(default)]
    pub verify_key: Option<String>,
    /// Signature of the new public key by the new sign key (user rotations).
    #[serde(default)]
    pub public_key_sig: Option<String>,
}

/// Rotation record payload the server prepares for one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRotationServerOutput {
    /// New generation.
    pub new_group_key_id: String,
    /// Generation the ephemeral key is sealed with.
    pub previous_group_key_id: String,
    /// Public key generation of the member the ephemeral key is wrapped for.
    pub encrypted_eph_key_key_id: String,
    /// The sealed ephemeral key, wrapped again for the member.
    pub encrypted_ephemeral_key_by_group_key_and_public_key: String,
    /// New key sealed with the ephemeral key.
    pub encrypted_group_key_by_ephemeral: String,
    /// Rotation time (ms).
    pub time: u64,
}

/// Body confirming a rotation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneKeyRotationInput {
    /// New key wrapped for the member.
    pub encrypted_new_group_key: String,
    /// Public key it is wrapped with.
    pub public_key_id: String,
}

/// One group key wrapped for a new member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMemberKey {
    /// Key generation id.
    pub group_key_id: String,
    /// Group key wrapped for the member.
    pub encrypted_group_key: String,
    /// Public key it is wrapped with.
    pub public_key_id: String,
}

/// Body of an invite, accepted join request or session upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMemberKeysInput {
    /// Wrapped keys of this page.
    pub keys: Vec<NewMemberKey>,
    /// Total number of keys of the group.
    pub key_count: usize,
    /// Rank of the new member.
    #[serde(default)]
    pub rank: Option<i32>,
}

/// One user key generation as delivered to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKeyData {
    /// Key generation id.
    pub group_key_id: String,
    /// Creation time (ms).
    pub time: u64,
    /// User symmetric key wrapped for the device.
    pub encrypted_group_key: String,
    /// Device key it is wrapped with.
    pub device_key_id: String,
    /// User private key sealed with the user symmetric key.
    pub encrypted_private_key: String,
    /// User public key.
    pub public_key: String,
    /// User sign key sealed with the user symmetric key.
    pub encrypted_sign_key: String,
    /// User verify key.
    pub verify_key: String,
    /// Signature of the public key by the sign key.
    pub public_key_sig: String,
}

/// Body registering a symmetric key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSymKeyInput {
    /// Key that wraps the new key.
    pub master_key_id: String,
    /// New key sealed with the master key.
    pub encrypted_key: String,
}

/// A symmetric key wrapped locally by a master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonRegisteredKey {
    /// Key that wraps the key.
    pub master_key_id: String,
    /// Id of the wrapped key.
    pub key_id: String,
    /// Key sealed with the master key.
    pub encrypted_key: String,
}
