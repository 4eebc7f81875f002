//! Records exchanged with the key server.
//!
//! Key material inside these records is always ciphertext produced or
//! consumed by the [`CryptoProvider`](crate::crypto::CryptoProvider).

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ListCursor;

/// A group key copy addressed to one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedGroupKey {
    /// Id of the private key that unwraps this copy.
    pub private_key_id: String,
    /// Provider blob with the wrapped key generation.
    pub key_data: String,
    /// User who signed the key generation.
    #[serde(default)]
    pub signed_by_user_id: Option<String>,
    /// Sign key generation the signer used.
    #[serde(default)]
    pub signed_by_user_sign_key_id: Option<String>,
}

/// A searchable or sortable key wrapped with a group key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedAuxKey {
    /// Group key generation that wraps this key.
    pub group_key_id: String,
    /// Provider blob.
    pub key_data: String,
}

/// Group metadata with the first page of key copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupServerData {
    /// Group id.
    pub group_id: String,
    /// Parent group, if this is a child group.
    #[serde(default)]
    pub parent_group_id: Option<String>,
    /// Rank of the requesting principal.
    pub rank: i32,
    /// A rotation is waiting to be finished by the requesting principal.
    pub key_update: bool,
    /// Creation time (ms).
    pub created_time: u64,
    /// Time the requesting principal joined (ms).
    pub joined_time: u64,
    /// Newest key copies first, at most one page.
    pub keys: Vec<FetchedGroupKey>,
    /// Searchable encryption keys, newest first.
    #[serde(default)]
    pub hmac_keys: Vec<FetchedAuxKey>,
    /// Sortable encryption keys, newest first.
    #[serde(default)]
    pub sortable_keys: Vec<FetchedAuxKey>,
    /// Set when access is inherited from an ancestor group.
    #[serde(default)]
    pub access_by_parent_group: Option<String>,
    /// Set when the request acted as a connected group.
    #[serde(default)]
    pub access_by_group_as_member: Option<String>,
    /// The group was created as a connected group.
    #[serde(default)]
    pub is_connected_group: bool,
}

/// Result of the lightweight update check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUpdateCheck {
    /// A rotation is waiting.
    pub key_update: bool,
    /// Current rank.
    pub rank: i32,
}

/// Result of starting a key rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRotationStarted {
    /// Rotated group, or the user id for user key rotations.
    pub group_id: String,
    /// Id of the new key generation.
    pub key_id: String,
}

/// Result of creating a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCreated {
    /// Id of the new group.
    pub group_id: String,
}

/// Result of an invite or accepted join request.
///
/// A session id means the server expects the remaining key pages through
/// session uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySessionOutput {
    /// Upload session for the remaining key pages.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Body of a rank change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRankInput {
    /// Member to change.
    pub changed_user_id: String,
    /// New rank.
    pub new_rank: i32,
}

/// Body of a JWT refresh through the key server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshInput {
    /// Refresh token.
    pub refresh_token: String,
}

impl fmt::Debug for RefreshInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshInput")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

/// Result of a JWT refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOutput {
    /// New JWT.
    pub jwt: String,
}

impl fmt::Debug for RefreshOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshOutput")
            .field("jwt", &"[REDACTED]")
            .finish()
    }
}

/// A user key generation wrapped for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedUserKey {
    /// Provider blob.
    pub key_data: String,
}

/// Public key of a user as published by the key server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPublicKeyData {
    /// Exported public key.
    pub public_key: String,
    /// Key generation id.
    pub public_key_id: String,
    /// Verify key generation that signed the public key.
    #[serde(default)]
    pub public_key_sig_key_id: Option<String>,
    /// Set locally once the signature was checked.
    #[serde(default)]
    pub verified: bool,
}

/// Verify key of a user key generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserVerifyKeyData {
    /// Exported verify key.
    pub verify_key: String,
    /// Key generation id.
    pub verify_key_id: String,
}

/// Newest public key of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPublicKeyData {
    /// Exported public key.
    pub public_key: String,
    /// Key generation id.
    pub public_key_id: String,
}

/// A registered symmetric key as stored by the key server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymKeyServerData {
    /// Key id.
    pub key_id: String,
    /// Id of the key that wraps it.
    pub master_key_id: String,
    /// Provider blob.
    pub encrypted_key: String,
    /// Creation time (ms).
    pub time: u64,
}

/// Result of registering a symmetric key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymKeyRegistered {
    /// Server assigned key id.
    pub key_id: String,
}

/// Kind of a group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberType {
    /// A user.
    User,
    /// A connected group.
    Group,
}

impl MemberType {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
        }
    }

    /// Parses from string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Listing items that can continue a paginated listing.
pub trait Paginated {
    /// Cursor pointing after this item.
    fn cursor(&self) -> ListCursor;
}

/// Cursor after `last`, or the first page.
pub fn cursor_after<T: Paginated>(last: Option<&T>) -> ListCursor {
    last.map_or_else(ListCursor::default, Paginated::cursor)
}

/// A group the principal is a member of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupListItem {
    /// Group id.
    pub group_id: String,
    /// Creation time (ms).
    pub time: u64,
    /// Join time (ms).
    pub joined_time: u64,
    /// Rank in the group.
    pub rank: i32,
    /// Parent group.
    #[serde(default)]
    pub parent: Option<String>,
}

impl Paginated for GroupListItem {
    fn cursor(&self) -> ListCursor {
        ListCursor::after(self.joined_time, self.group_id.clone())
    }
}

/// A pending invite or sent join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInviteListItem {
    /// Group id.
    pub group_id: String,
    /// Time of the invite (ms).
    pub time: u64,
}

impl Paginated for GroupInviteListItem {
    fn cursor(&self) -> ListCursor {
        ListCursor::after(self.time, self.group_id.clone())
    }
}

/// A direct child group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChildrenListItem {
    /// Child group id.
    pub group_id: String,
    /// Creation time (ms).
    pub time: u64,
    /// Parent of the child.
    #[serde(default)]
    pub parent: Option<String>,
}

impl Paginated for GroupChildrenListItem {
    fn cursor(&self) -> ListCursor {
        ListCursor::after(self.time, self.group_id.clone())
    }
}

/// A member of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUserListItem {
    /// User or connected group id.
    pub user_id: String,
    /// Rank.
    pub rank: i32,
    /// Join time (ms).
    pub joined_time: u64,
    /// Member kind.
    pub user_type: MemberType,
}

impl Paginated for GroupUserListItem {
    fn cursor(&self) -> ListCursor {
        ListCursor::after(self.joined_time, self.user_id.clone())
    }
}

/// A pending join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupJoinReqListItem {
    /// Requesting user or group.
    pub user_id: String,
    /// Request time (ms).
    pub time: u64,
    /// Requester kind.
    pub user_type: MemberType,
}

impl Paginated for GroupJoinReqListItem {
    fn cursor(&self) -> ListCursor {
        ListCursor::after(self.time, self.user_id.clone())
    }
}

/// A device that signed in but holds no user keys yet. The new device
/// shows it to the user, who passes it to a device already registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    /// Id of the new device.
    pub device_id: String,
    /// Device identifier chosen at sign in.
    pub device_identifier: String,
    /// Public key of the new device the user keys are wrapped for.
    pub public_key: String,
}

/// A device of the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeviceListItem {
    /// Device id.
    pub device_id: String,
    /// Registration time (ms).
    pub time: u64,
    /// Device identifier chosen at registration.
    pub device_identifier: String,
}

impl Paginated for UserDeviceListItem {
    fn cursor(&self) -> ListCursor {
        ListCursor::after(self.time, self.device_id.clone())
    }
}
