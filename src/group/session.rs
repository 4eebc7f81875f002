//! An opened group.

use log::info;
use serde::de::DeserializeOwned;

use super::invite::{self, KeyUploadReport, PageUpload};
use crate::context::Context;
use crate::error::{Result, SdkError};
use crate::keygraph::{
    AccessPath, GroupData, GroupKey, KeyGraphResolver, ResolveOptions, RotationCoordinator,
    RotationReport, VerifyLevel,
};
use crate::net::types::{
    cursor_after, ChangeRankInput, GroupChildrenListItem, GroupCreated, GroupInviteListItem,
    GroupJoinReqListItem, GroupListItem, GroupUserListItem, KeySessionOutput, MemberType,
};
use crate::net::{HttpMethod, Request};
use crate::store::StorageKey;
use crate::sym_key::{self, SymKey};
use crate::user::UserSession;

/// Highest rank allowed to manage the group itself.
const RANK_GROUP_ADMIN: i32 = 1;
/// Highest rank allowed to manage members.
const RANK_MEMBER_ADMIN: i32 = 2;

/// A group opened by a [`UserSession`].
///
/// Operations that need the user's keys or JWT take the session that opened
/// the group.
pub struct GroupSession {
    ctx: Context,
    data: GroupData,
}

impl std::fmt::Debug for GroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSession")
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

/// How a new member is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InviteKind {
    Invite,
    InviteAuto,
    ReInvite,
}

impl GroupSession {
    pub(crate) fn new(ctx: Context, data: GroupData) -> Self {
        Self { ctx, data }
    }

    // ==================== Accessors ====================

    /// Group id.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.data.group_id
    }

    /// Parent group id.
    #[must_use]
    pub fn parent_group_id(&self) -> Option<&str> {
        self.data.parent_group_id.as_deref()
    }

    /// Rank of the owner of this snapshot.
    #[must_use]
    pub const fn rank(&self) -> i32 {
        self.data.rank
    }

    /// A rotation waits to be finished.
    #[must_use]
    pub const fn key_update(&self) -> bool {
        self.data.key_update
    }

    /// Stored snapshot.
    #[must_use]
    pub const fn data(&self) -> &GroupData {
        &self.data
    }

    /// How key copies of this group are unwrapped.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::BrokenAccessChain` for a snapshot accessed through
    /// a parent it does not name.
    pub fn access_path(&self) -> Result<AccessPath> {
        self.data.access_path()
    }

    /// Newest key generation.
    ///
    /// # Errors
    ///
    /// Returns an error if keys exist but none is marked newest.
    pub fn newest_key(&self) -> Result<&GroupKey> {
        self.data.newest_key()
    }

    /// Key generation `key_id`, fetched and unwrapped if not stored yet.
    ///
    /// # Errors
    ///
    /// - `SdkError::Server` with `server_304` if this principal has no copy
    ///   of the generation (a rotation may need finishing)
    /// - `SdkError::KeyNotFound` if it is still missing after the fetch
    pub async fn sym_key_by_id(
        &mut self,
        user: &mut UserSession,
        key_id: &str,
        verify: VerifyLevel,
    ) -> Result<GroupKey> {
        KeyGraphResolver::new(&self.ctx, user)
            .get_group_key(&mut self.data, key_id, false, verify)
            .await
    }

    /// Refreshes rank and the key update flag.
    ///
    /// # Errors
    ///
    /// Returns transport, server or store errors.
    pub async fn update_check(&mut self, user: &mut UserSession) -> Result<()> {
        KeyGraphResolver::new(&self.ctx, user)
            .update_check(&mut self.data)
            .await
    }

    fn require_rank(&self, max_rank: i32) -> Result<()> {
        if self.data.rank > max_rank {
            return Err(SdkError::no_rank());
        }
        Ok(())
    }

    fn path(&self, suffix: &str) -> String {
        format!("api/v1/group/{}/{suffix}", self.data.group_id)
    }

    async fn request(
        &self,
        user: &mut UserSession,
        method: HttpMethod,
        path: &str,
    ) -> Result<Request> {
        let jwt = user.jwt().await?;
        Ok(self
            .ctx
            .request(method, path)
            .with_jwt(jwt)
            .with_group_as_member(self.data.access_by_group_as_member.as_deref()))
    }

    async fn get<T: DeserializeOwned>(&self, user: &mut UserSession, path: &str) -> Result<T> {
        let request = self.request(user, HttpMethod::Get, path).await?;
        self.ctx.call(request).await
    }

    async fn send(&self, user: &mut UserSession, method: HttpMethod, path: &str) -> Result<()> {
        let request = self.request(user, method, path).await?;
        self.ctx.call_general(request).await
    }

    async fn forget(&self, user: &UserSession) -> Result<()> {
        self.ctx
            .remove(&StorageKey::group_data(
                self.data.owner_id(user.user_id()),
                &self.data.group_id,
            ))
            .await
    }

    // ==================== Payloads ====================

    /// Encrypts bytes with the newest key, optionally signed with the user's
    /// newest sign key.
    ///
    /// # Errors
    ///
    /// Returns key or crypto errors.
    pub fn encrypt(&self, user: &UserSession, data: &[u8], sign: bool) -> Result<Vec<u8>> {
        let sign_key = if sign {
            Some(user.newest_sign_key()?)
        } else {
            None
        };
        Ok(self
            .ctx
            .crypto
            .encrypt_symmetric(&self.newest_key()?.group_key, data, sign_key)?)
    }

    /// String form of [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns key or crypto errors.
    pub fn encrypt_string(&self, user: &UserSession, data: &str, sign: bool) -> Result<String> {
        let sign_key = if sign {
            Some(user.newest_sign_key()?)
        } else {
            None
        };
        Ok(self
            .ctx
            .crypto
            .encrypt_string_symmetric(&self.newest_key()?.group_key, data, sign_key)?)
    }

    /// Decrypts bytes with the generation named in their head. With
    /// `verify_with`, a signed payload is checked against that user's verify
    /// key.
    ///
    /// # Errors
    ///
    /// - `SdkError::Server` with `server_304` if the generation is not
    ///   available to this principal yet
    /// - lookup and crypto errors
    pub async fn decrypt(
        &mut self,
        user: &mut UserSession,
        data: &[u8],
        verify_with: Option<&str>,
    ) -> Result<Vec<u8>> {
        let head = self.ctx.crypto.split_head(data)?;
        let key = self.sym_key_by_id(user, &head.id, VerifyLevel::Off).await?;
        let verify_key = user.sender_verify_key(head.sign.as_ref(), verify_with).await?;
        Ok(self
            .ctx
            .crypto
            .decrypt_symmetric(&key.group_key, data, verify_key.as_deref())?)
    }

    /// String form of [`decrypt`](Self::decrypt).
    ///
    /// # Errors
    ///
    /// See [`decrypt`](Self::decrypt).
    pub async fn decrypt_string(
        &mut self,
        user: &mut UserSession,
        data: &str,
        verify_with: Option<&str>,
    ) -> Result<String> {
        let head = self.ctx.crypto.split_head_string(data)?;
        let key = self.sym_key_by_id(user, &head.id, VerifyLevel::Off).await?;
        let verify_key = user.sender_verify_key(head.sign.as_ref(), verify_with).await?;
        Ok(self
            .ctx
            .crypto
            .decrypt_string_symmetric(&key.group_key, data, verify_key.as_deref())?)
    }

    // ==================== Related Groups ====================

    /// Direct children, one page after `last`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn children(
        &self,
        user: &mut UserSession,
        last: Option<&GroupChildrenListItem>,
    ) -> Result<Vec<GroupChildrenListItem>> {
        let path = self.path(&format!("children/{}", cursor_after(last).path()));
        self.get(user, &path).await
    }

    /// Opens a child group through this group.
    ///
    /// # Errors
    ///
    /// Returns resolution errors.
    pub async fn get_child_group(
        &self,
        user: &mut UserSession,
        child_id: &str,
        verify: VerifyLevel,
    ) -> Result<Self> {
        let options = ResolveOptions::child(self.data.access_by_group_as_member.clone())
            .with_verify(verify);
        user.get_group_with(child_id, options).await
    }

    /// Opens a group this group is a member of, acting as this group.
    ///
    /// # Errors
    ///
    /// Returns resolution errors.
    pub async fn get_connected_group(
        &self,
        user: &mut UserSession,
        connected_id: &str,
        verify: VerifyLevel,
    ) -> Result<Self> {
        let options = ResolveOptions::as_member(self.data.group_id.clone()).with_verify(verify);
        user.get_group_with(connected_id, options).await
    }

    /// Creates a child group whose keys are wrapped with this group's newest
    /// key pair.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 1, otherwise crypto, transport or server
    /// errors.
    pub async fn create_child_group(&self, user: &mut UserSession, sign: bool) -> Result<String> {
        self.create_related_group(user, sign, "child").await
    }

    /// Creates a connected group with this group as its first member.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 1, otherwise crypto, transport or server
    /// errors.
    pub async fn create_connected_group(
        &self,
        user: &mut UserSession,
        sign: bool,
    ) -> Result<String> {
        self.create_related_group(user, sign, "connected").await
    }

    async fn create_related_group(
        &self,
        user: &mut UserSession,
        sign: bool,
        route: &str,
    ) -> Result<String> {
        self.require_rank(RANK_GROUP_ADMIN)?;
        let sign_key = if sign {
            Some(user.newest_sign_key()?.to_string())
        } else {
            None
        };
        let body = self.ctx.crypto.prepare_create_group(
            &self.newest_key()?.public_group_key,
            sign_key.as_deref(),
            user.user_id(),
        )?;

        let request = self
            .request(user, HttpMethod::Post, &self.path(route))
            .await?
            .with_body(body);
        let created: GroupCreated = self.ctx.call(request).await?;
        info!(
            "created {route} group {} of {}",
            created.group_id, self.data.group_id
        );
        Ok(created.group_id)
    }

    // ==================== Members ====================

    /// Members, one page after `last`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn members(
        &self,
        user: &mut UserSession,
        last: Option<&GroupUserListItem>,
    ) -> Result<Vec<GroupUserListItem>> {
        let path = self.path(&format!("member/{}", cursor_after(last).path()));
        self.get(user, &path).await
    }

    /// Invites a user; the invite waits for acceptance.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 2, otherwise lookup, crypto, transport or
    /// server errors. Failed session uploads are reported, not raised.
    pub async fn invite(
        &self,
        user: &mut UserSession,
        user_id: &str,
        rank: Option<i32>,
    ) -> Result<KeyUploadReport> {
        self.add_member(user, InviteKind::Invite, MemberType::User, user_id, rank)
            .await
    }

    /// Adds a user without waiting for acceptance.
    ///
    /// # Errors
    ///
    /// See [`invite`](Self::invite).
    pub async fn invite_auto(
        &self,
        user: &mut UserSession,
        user_id: &str,
        rank: Option<i32>,
    ) -> Result<KeyUploadReport> {
        self.add_member(user, InviteKind::InviteAuto, MemberType::User, user_id, rank)
            .await
    }

    /// Invites a group as a member.
    ///
    /// # Errors
    ///
    /// See [`invite`](Self::invite).
    pub async fn invite_group(
        &self,
        user: &mut UserSession,
        group_id: &str,
        rank: Option<i32>,
    ) -> Result<KeyUploadReport> {
        self.add_member(user, InviteKind::Invite, MemberType::Group, group_id, rank)
            .await
    }

    /// Adds a group as a member without waiting for acceptance.
    ///
    /// # Errors
    ///
    /// See [`invite`](Self::invite).
    pub async fn invite_group_auto(
        &self,
        user: &mut UserSession,
        group_id: &str,
        rank: Option<i32>,
    ) -> Result<KeyUploadReport> {
        self.add_member(user, InviteKind::InviteAuto, MemberType::Group, group_id, rank)
            .await
    }

    /// Sends a new invite to a user whose key copies are outdated.
    ///
    /// # Errors
    ///
    /// See [`invite`](Self::invite).
    pub async fn re_invite_user(
        &self,
        user: &mut UserSession,
        user_id: &str,
    ) -> Result<KeyUploadReport> {
        self.add_member(user, InviteKind::ReInvite, MemberType::User, user_id, None)
            .await
    }

    /// Sends a new invite to a member group whose key copies are outdated.
    ///
    /// # Errors
    ///
    /// See [`invite`](Self::invite).
    pub async fn re_invite_group(
        &self,
        user: &mut UserSession,
        group_id: &str,
    ) -> Result<KeyUploadReport> {
        self.add_member(user, InviteKind::ReInvite, MemberType::Group, group_id, None)
            .await
    }

    async fn add_member(
        &self,
        user: &mut UserSession,
        kind: InviteKind,
        member: MemberType,
        member_id: &str,
        rank: Option<i32>,
    ) -> Result<KeyUploadReport> {
        self.require_rank(RANK_MEMBER_ADMIN)?;
        let route = match (kind, member) {
            (InviteKind::Invite, MemberType::User) => "invite",
            (InviteKind::Invite, MemberType::Group) => "invite_group",
            (InviteKind::InviteAuto, MemberType::User) => "invite_auto",
            (InviteKind::InviteAuto, MemberType::Group) => "invite_group_auto",
            (InviteKind::ReInvite, MemberType::User) => "re_invite",
            (InviteKind::ReInvite, MemberType::Group) => "re_invite_group",
        };

        let public_key = invite::member_public_key(&self.ctx, member, member_id).await?;
        let (body, _) = invite::key_page_body(&self.ctx, &self.data.keys, &public_key, 0, rank)?;
        let request = self
            .request(user, HttpMethod::Put, &self.path(&format!("{route}/{member_id}")))
            .await?
            .with_body(body);
        let output: KeySessionOutput = self.ctx.call(request).await?;
        info!("added {member_id} to group {} ({route})", self.data.group_id);

        self.upload_session(user, output, "invite", &public_key).await
    }

    async fn upload_session(
        &self,
        user: &mut UserSession,
        output: KeySessionOutput,
        route: &str,
        public_key: &str,
    ) -> Result<KeyUploadReport> {
        let Some(session_id) = output.session_id.filter(|id| !id.is_empty()) else {
            return Ok(KeyUploadReport {
                session_id: None,
                uploaded_pages: 1,
                failed_pages: Vec::new(),
            });
        };

        let jwt = user.jwt().await?;
        let session_path = self.path(&format!("{route}/session/{session_id}"));
        let target = PageUpload {
            session_path: &session_path,
            owner: &self.data.group_id,
            group_as_member: self.data.access_by_group_as_member.as_deref(),
        };
        let (uploaded, failed_pages) =
            invite::upload_remaining_pages(&self.ctx, &jwt, &self.data.keys, &target, public_key)
                .await?;
        Ok(KeyUploadReport {
            session_id: Some(session_id),
            uploaded_pages: uploaded + 1,
            failed_pages,
        })
    }

    /// Pending join requests, one page after `last`.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 2, otherwise transport or server errors.
    pub async fn join_requests(
        &self,
        user: &mut UserSession,
        last: Option<&GroupJoinReqListItem>,
    ) -> Result<Vec<GroupJoinReqListItem>> {
        self.require_rank(RANK_MEMBER_ADMIN)?;
        let path = self.path(&format!("join_req/{}", cursor_after(last).path()));
        self.get(user, &path).await
    }

    /// Accepts a join request and hands the requester its key copies.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 2, otherwise lookup, crypto, transport or
    /// server errors.
    pub async fn accept_join_request(
        &self,
        user: &mut UserSession,
        member_id: &str,
        member: MemberType,
        rank: Option<i32>,
    ) -> Result<KeyUploadReport> {
        self.require_rank(RANK_MEMBER_ADMIN)?;
        let public_key = invite::member_public_key(&self.ctx, member, member_id).await?;
        let (body, _) = invite::key_page_body(&self.ctx, &self.data.keys, &public_key, 0, rank)?;
        let request = self
            .request(user, HttpMethod::Put, &self.path(&format!("join_req/{member_id}")))
            .await?
            .with_body(body);
        let output: KeySessionOutput = self.ctx.call(request).await?;

        self.upload_session(user, output, "join_req", &public_key).await
    }

    /// Rejects a join request.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 2, otherwise transport or server errors.
    pub async fn reject_join_request(&self, user: &mut UserSession, member_id: &str) -> Result<()> {
        self.require_rank(RANK_MEMBER_ADMIN)?;
        self.send(user, HttpMethod::Delete, &self.path(&format!("join_req/{member_id}")))
            .await
    }

    /// Stops accepting invites and join requests.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 1, otherwise transport or server errors.
    pub async fn stop_invites(&self, user: &mut UserSession) -> Result<()> {
        self.require_rank(RANK_GROUP_ADMIN)?;
        self.send(user, HttpMethod::Patch, &self.path("change_invite"))
            .await
    }

    /// Changes the rank of a member. Changing the owner's own rank updates
    /// the snapshot.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 1, otherwise transport, server or store
    /// errors.
    pub async fn update_rank(
        &mut self,
        user: &mut UserSession,
        member_id: &str,
        new_rank: i32,
    ) -> Result<()> {
        self.require_rank(RANK_GROUP_ADMIN)?;
        let body = serde_json::to_string(&ChangeRankInput {
            changed_user_id: member_id.to_string(),
            new_rank,
        })?;
        let request = self
            .request(user, HttpMethod::Put, &self.path("change_rank"))
            .await?
            .with_body(body);
        self.ctx.call_general(request).await?;

        if self.data.owner_id(user.user_id()) == member_id {
            self.data.rank = new_rank;
            KeyGraphResolver::new(&self.ctx, user)
                .save_group(&self.data)
                .await?;
        }
        Ok(())
    }

    /// Removes a member.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 2, otherwise transport or server errors.
    pub async fn kick_user(&self, user: &mut UserSession, member_id: &str) -> Result<()> {
        self.require_rank(RANK_MEMBER_ADMIN)?;
        self.send(user, HttpMethod::Delete, &self.path(&format!("kick/{member_id}")))
            .await
    }

    /// Leaves the group and forgets the local snapshot.
    ///
    /// # Errors
    ///
    /// Returns transport, server or store errors.
    pub async fn leave(self, user: &mut UserSession) -> Result<()> {
        self.send(user, HttpMethod::Delete, &self.path("leave")).await?;
        self.forget(user).await
    }

    /// Deletes the group and forgets the local snapshot.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 1, otherwise transport, server or store
    /// errors.
    pub async fn delete_group(self, user: &mut UserSession) -> Result<()> {
        self.require_rank(RANK_GROUP_ADMIN)?;
        let path = format!("api/v1/group/{}", self.data.group_id);
        self.send(user, HttpMethod::Delete, &path).await?;
        info!("deleted group {}", self.data.group_id);
        self.forget(user).await
    }

    // ==================== Group As Member ====================

    /// Groups this group is a member of, one page after `last`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn groups(
        &self,
        user: &mut UserSession,
        last: Option<&GroupListItem>,
    ) -> Result<Vec<GroupListItem>> {
        let path = self.path(&format!("all/{}", cursor_after(last).path()));
        self.get(user, &path).await
    }

    /// Invites this group received, one page after `last`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn group_invites(
        &self,
        user: &mut UserSession,
        last: Option<&GroupInviteListItem>,
    ) -> Result<Vec<GroupInviteListItem>> {
        let path = self.path(&format!("invite/{}", cursor_after(last).path()));
        self.get(user, &path).await
    }

    /// Accepts an invite of this group into `group_id`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn accept_group_invite(&self, user: &mut UserSession, group_id: &str) -> Result<()> {
        self.send(user, HttpMethod::Patch, &self.path(&format!("{group_id}/invite")))
            .await
    }

    /// Rejects an invite of this group into `group_id`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn reject_group_invite(&self, user: &mut UserSession, group_id: &str) -> Result<()> {
        self.send(user, HttpMethod::Delete, &self.path(&format!("{group_id}/invite")))
            .await
    }

    /// Asks for this group to join `group_id`.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 1, otherwise transport or server errors.
    pub async fn join_request(&self, user: &mut UserSession, group_id: &str) -> Result<()> {
        self.require_rank(RANK_GROUP_ADMIN)?;
        self.send(user, HttpMethod::Patch, &self.path(&format!("join_req/{group_id}")))
            .await
    }

    /// Join requests this group sent, one page after `last`.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 1, otherwise transport or server errors.
    pub async fn sent_join_requests(
        &self,
        user: &mut UserSession,
        last: Option<&GroupInviteListItem>,
    ) -> Result<Vec<GroupInviteListItem>> {
        self.require_rank(RANK_GROUP_ADMIN)?;
        let path = self.path(&format!("joins/{}", cursor_after(last).path()));
        self.get(user, &path).await
    }

    /// Withdraws a join request of this group.
    ///
    /// # Errors
    ///
    /// `client_201` below rank 1, otherwise transport or server errors.
    pub async fn delete_join_request(&self, user: &mut UserSession, group_id: &str) -> Result<()> {
        self.require_rank(RANK_GROUP_ADMIN)?;
        self.send(user, HttpMethod::Delete, &self.path(&format!("joins/{group_id}")))
            .await
    }

    // ==================== Key Rotation ====================

    /// Starts a key rotation. The new generation becomes the newest key
    /// right away.
    ///
    /// # Errors
    ///
    /// Returns resolution, crypto, transport or server errors.
    pub async fn key_rotation(&mut self, user: &mut UserSession, sign: bool) -> Result<GroupKey> {
        let mut resolver = KeyGraphResolver::new(&self.ctx, user);
        RotationCoordinator::new(&mut resolver)
            .start_group_rotation(&mut self.data, sign)
            .await
    }

    /// Applies the rotation backlog of this group.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors, and errors of records that fail
    /// although their previous key is available.
    pub async fn finish_key_rotation(
        &mut self,
        user: &mut UserSession,
        verify: VerifyLevel,
    ) -> Result<RotationReport> {
        let mut resolver = KeyGraphResolver::new(&self.ctx, user);
        RotationCoordinator::new(&mut resolver)
            .finish_group_rotation(&mut self.data, verify)
            .await
    }

    // ==================== Search and Sort ====================

    /// Search tokens for `data` with the newest searchable key: one for the
    /// full value, or one per prefix up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns key or crypto errors.
    pub fn create_search_raw(
        &self,
        data: &str,
        full: bool,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        Ok(self
            .ctx
            .crypto
            .create_searchable(self.data.newest_hmac_key()?, data, full, limit)?)
    }

    /// Like [`create_search_raw`](Self::create_search_raw), also returning
    /// the id of the key generation the searchable key belongs to.
    ///
    /// # Errors
    ///
    /// Returns key or crypto errors.
    pub fn create_search(
        &self,
        data: &str,
        full: bool,
        limit: Option<usize>,
    ) -> Result<(Vec<String>, String)> {
        let tokens = self.create_search_raw(data, full, limit)?;
        Ok((tokens, self.newest_key()?.group_key_id.clone()))
    }

    /// Token to look up `data`.
    ///
    /// # Errors
    ///
    /// Returns key or crypto errors.
    pub fn search(&self, data: &str) -> Result<String> {
        Ok(self.ctx.crypto.search(self.data.newest_hmac_key()?, data)?)
    }

    /// Order preserving encoding of a number with the newest sortable key.
    ///
    /// # Errors
    ///
    /// Returns key or crypto errors.
    pub fn encrypt_sortable_number(&self, number: u64) -> Result<u64> {
        Ok(self
            .ctx
            .crypto
            .sortable_encrypt_number(self.data.newest_sortable_key()?, number)?)
    }

    /// Order preserving encoding of the leading bytes of a string.
    ///
    /// # Errors
    ///
    /// Returns key or crypto errors.
    pub fn encrypt_sortable_string(&self, data: &str) -> Result<u64> {
        Ok(self
            .ctx
            .crypto
            .sortable_encrypt_string(self.data.newest_sortable_key()?, data)?)
    }

    // ==================== Standalone Keys ====================

    /// Creates a key wrapped by the newest group key without registering it.
    ///
    /// # Errors
    ///
    /// Returns key or crypto errors.
    pub fn generate_non_registered_key(&self) -> Result<(SymKey, String)> {
        let newest = self.newest_key()?;
        sym_key::generate_non_registered(&self.ctx, &newest.group_key, &newest.group_key_id)
    }

    /// Unwraps a blob created by
    /// [`generate_non_registered_key`](Self::generate_non_registered_key).
    ///
    /// # Errors
    ///
    /// Returns key or crypto errors.
    pub async fn decrypt_non_registered_key(
        &mut self,
        user: &mut UserSession,
        master_key_id: &str,
        wrapped: &str,
    ) -> Result<SymKey> {
        let master = self.sym_key_by_id(user, master_key_id, VerifyLevel::Off).await?;
        sym_key::decrypt_non_registered(&self.ctx, &master.group_key, master_key_id, wrapped)
    }

    /// Registers a key wrapped by the newest group key.
    ///
    /// # Errors
    ///
    /// Returns key, crypto, transport or server errors.
    pub async fn generate_key(&self, user: &mut UserSession) -> Result<SymKey> {
        let master = self.newest_key()?.group_key.clone();
        let jwt = user.jwt().await?;
        let data = sym_key::register(&self.ctx, jwt, &master).await?;
        sym_key::open(&self.ctx, &master, &data)
    }

    /// Fetches and unwraps a registered key wrapped by one of this group's
    /// key generations.
    ///
    /// # Errors
    ///
    /// Returns key, crypto, transport or server errors.
    pub async fn fetch_key(&mut self, user: &mut UserSession, key_id: &str) -> Result<SymKey> {
        let jwt = user.jwt().await?;
        let data = sym_key::fetch(&self.ctx, jwt, key_id).await?;
        let master = self
            .sym_key_by_id(user, &data.master_key_id, VerifyLevel::Off)
            .await?;
        sym_key::open(&self.ctx, &master.group_key, &data)
    }
}
