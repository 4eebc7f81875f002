//! Group key data model.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::key_ring::{KeyRing, VersionedKey};
use crate::error::{Result, SdkError};

/// One generation of a group's key material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey {
    /// Generation id, shared by the symmetric key and the key pair.
    pub group_key_id: String,
    /// Exported symmetric key.
    pub group_key: String,
    /// Exported private key (rotation target, child and connected groups).
    pub private_group_key: String,
    /// Exported public key.
    pub public_group_key: String,
    /// Public key in the form the key server publishes.
    pub exported_public_key: String,
    /// Creation time (ms).
    pub time: u64,
}

impl VersionedKey for GroupKey {
    fn key_id(&self) -> &str {
        &self.group_key_id
    }

    fn created_at(&self) -> u64 {
        self.time
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupKey")
            .field("group_key_id", &self.group_key_id)
            .field("group_key", &"[REDACTED]")
            .field("private_group_key", &"[REDACTED]")
            .field("public_group_key", &self.public_group_key)
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}

/// How the key copies of a group are unwrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPath {
    /// With the user's own private keys.
    Direct,
    /// With the private keys of the direct parent group.
    ViaParent {
        /// Direct parent group.
        parent_group_id: String,
        /// Connected group the parent was resolved as, if any.
        as_member: Option<String>,
    },
    /// With the private keys of a connected group the user belongs to.
    ViaConnectedGroup {
        /// The connected group.
        member_group_id: String,
    },
}

impl AccessPath {
    /// Owner of the stored record this path reads keys from.
    #[must_use]
    pub fn key_owner<'a>(&'a self, user_id: &'a str) -> &'a str {
        match self {
            Self::Direct | Self::ViaConnectedGroup { .. } => user_id,
            Self::ViaParent { as_member, .. } => as_member.as_deref().unwrap_or(user_id),
        }
    }
}

/// Snapshot of a group as seen by one user or connected group.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupData {
    /// Group id.
    pub group_id: String,
    /// Direct parent group.
    pub parent_group_id: Option<String>,
    /// Rank of the owner; lower is more privileged, 0 is the creator.
    pub rank: i32,
    /// A rotation waits to be finished.
    pub key_update: bool,
    /// Creation time (ms).
    pub created_time: u64,
    /// Join time (ms).
    pub joined_time: u64,
    /// Key generations.
    pub keys: KeyRing<GroupKey>,
    /// Key copies are unwrapped with the parent group's keys.
    pub from_parent: bool,
    /// Connected group this snapshot was resolved as.
    pub access_by_group_as_member: Option<String>,
    /// Ancestor the access is inherited from, as reported by the server.
    pub access_by_parent_group: Option<String>,
    /// The group was created as a connected group.
    pub is_connected_group: bool,
    /// Searchable encryption keys, newest first.
    pub hmac_keys: Vec<String>,
    /// Sortable encryption keys, newest first.
    pub sortable_keys: Vec<String>,
    /// Last rank/key-update refresh (ms).
    pub last_check_time: i64,
}

impl GroupData {
    /// Returns the path key copies of this group are unwrapped through.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::BrokenAccessChain` if the snapshot needs its parent
    /// but has no parent id.
    pub fn access_path(&self) -> Result<AccessPath> {
        if self.from_parent {
            let parent_group_id = self.parent_group_id.clone().ok_or_else(|| {
                SdkError::BrokenAccessChain(format!(
                    "group {} is accessed through its parent but has no parent id",
                    self.group_id
                ))
            })?;
            return Ok(AccessPath::ViaParent {
                parent_group_id,
                as_member: self.access_by_group_as_member.clone(),
            });
        }

        Ok(self
            .access_by_group_as_member
            .as_ref()
            .map_or(AccessPath::Direct, |id| AccessPath::ViaConnectedGroup {
                member_group_id: id.clone(),
            }))
    }

    /// Owner id this snapshot is stored under.
    #[must_use]
    pub fn owner_id<'a>(&'a self, user_id: &'a str) -> &'a str {
        self.access_by_group_as_member.as_deref().unwrap_or(user_id)
    }

    /// Newest key generation.
    ///
    /// # Errors
    ///
    /// Returns an error if no generation is marked newest.
    pub fn newest_key(&self) -> Result<&GroupKey> {
        self.keys.newest()
    }

    /// Id of the newest key generation.
    #[must_use]
    pub fn newest_key_id(&self) -> Option<&str> {
        self.keys.newest_key_id()
    }

    /// Newest searchable encryption key.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::KeyNotFound` if the group has none.
    pub fn newest_hmac_key(&self) -> Result<&str> {
        self.hmac_keys
            .first()
            .map(String::as_str)
            .ok_or_else(|| SdkError::KeyNotFound(format!("hmac key of group {}", self.group_id)))
    }

    /// Newest sortable encryption key.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::KeyNotFound` if the group has none.
    pub fn newest_sortable_key(&self) -> Result<&str> {
        self.sortable_keys.first().map(String::as_str).ok_or_else(|| {
            SdkError::KeyNotFound(format!("sortable key of group {}", self.group_id))
        })
    }
}

impl fmt::Debug for GroupData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupData")
            .field("group_id", &self.group_id)
            .field("parent_group_id", &self.parent_group_id)
            .field("rank", &self.rank)
            .field("key_update", &self.key_update)
            .field("keys", &self.keys.len())
            .field("newest_key_id", &self.newest_key_id())
            .field("from_parent", &self.from_parent)
            .field("access_by_group_as_member", &self.access_by_group_as_member)
            .field("access_by_parent_group", &self.access_by_parent_group)
            .field("is_connected_group", &self.is_connected_group)
            .finish_non_exhaustive()
    }
}

/// A pending rotation for one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationRecord {
    /// Generation that must be available to unwrap this record.
    pub pre_group_key_id: String,
    /// Generation this record delivers.
    pub new_group_key_id: String,
    /// Private key generation that unwraps the ephemeral key.
    pub encrypted_eph_key_key_id: String,
    /// Provider blob.
    pub server_output: String,
}

/// How strictly signatures on key generations are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum VerifyLevel {
    /// Signatures are not checked.
    #[default]
    Off,
    /// Checked when the signer's verify key can be fetched; fetch failures
    /// are ignored.
    Tolerant,
    /// Checked; a fetch failure is ignored only if the signer no longer
    /// exists.
    Strict,
}

impl VerifyLevel {
    /// Maps the numeric levels 0, 1 and 2. Higher values are strict.
    #[must_use]
    pub const fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Off,
            1 => Self::Tolerant,
            _ => Self::Strict,
        }
    }

    /// Returns the numeric level.
    #[must_use]
    pub const fn as_level(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Tolerant => 1,
            Self::Strict => 2,
        }
    }
}

/// Access context of a resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// The group is opened as a child of a group the caller already holds.
    pub via_parent: bool,
    /// Connected group the resolution acts as.
    pub group_as_member: Option<String>,
    /// Signature checks for unwrapped keys.
    pub verify: VerifyLevel,
    /// Set on resolutions started by another resolution.
    pub(crate) nested: bool,
}

impl ResolveOptions {
    /// Direct access by the user.
    #[must_use]
    pub fn direct() -> Self {
        Self::default()
    }

    /// Access to a child group, optionally as a connected group.
    #[must_use]
    pub fn child(as_member: Option<String>) -> Self {
        Self {
            via_parent: true,
            group_as_member: as_member,
            ..Self::default()
        }
    }

    /// Access as a connected group.
    #[must_use]
    pub fn as_member(group_id: impl Into<String>) -> Self {
        Self {
            group_as_member: Some(group_id.into()),
            ..Self::default()
        }
    }

    /// Sets the verify level.
    #[must_use]
    pub const fn with_verify(mut self, verify: VerifyLevel) -> Self {
        self.verify = verify;
        self
    }
}
