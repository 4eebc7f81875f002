//! Group key resolution across the access graph.
//!
//! A group is reached directly, through its parent, or through a connected
//! group the user belongs to. The [`AccessPath`] of a stored snapshot decides
//! which private key unwraps its key copies:
//!
//! ```text
//! Direct              ─▶ user key generation        (UserSession)
//! ViaParent           ─▶ parent group key generation (store: owner, parent)
//! ViaConnectedGroup   ─▶ connected group generation  (store: user, member)
//! ```
//!
//! Related groups are read from the key store by `(owner, group)` key and
//! never held by reference. Missing related snapshots are fatal
//! ([`SdkError::BrokenAccessChain`]).

use futures::future::BoxFuture;
use log::{debug, info, warn};

use super::key_ring::KeyRing;
use super::types::{AccessPath, GroupData, GroupKey, ResolveOptions, VerifyLevel};
use crate::config::KEY_PAGE_SIZE;
use crate::context::{now_millis, Context};
use crate::directory;
use crate::error::{Result, SdkError, SERVER_IDENTITY_NOT_FOUND};
use crate::net::types::{
    FetchedAuxKey, FetchedGroupKey, GroupPublicKeyData, GroupServerData, GroupUpdateCheck,
};
use crate::net::{HttpMethod, ListCursor, Request};
use crate::store::StorageKey;
use crate::user::UserSession;

/// Resolves group snapshots and their key generations for one user.
pub struct KeyGraphResolver<'a> {
    ctx: &'a Context,
    user: &'a mut UserSession,
}

impl<'a> KeyGraphResolver<'a> {
    /// Creates a resolver acting for `user`.
    pub fn new(ctx: &'a Context, user: &'a mut UserSession) -> Self {
        Self { ctx, user }
    }

    /// Shared collaborators.
    #[must_use]
    pub const fn context(&self) -> &'a Context {
        self.ctx
    }

    /// The user the resolver acts for.
    pub fn user(&mut self) -> &mut UserSession {
        self.user
    }

    // ==================== Resolution ====================

    /// Returns the snapshot of `group_id` for the access described by
    /// `options`.
    ///
    /// A stored snapshot is returned as is, after a rank and key update
    /// refresh once it is older than the configured TTL. Otherwise the group
    /// is fetched, the groups it depends on are resolved first, all key
    /// pages are unwrapped and the result is stored.
    ///
    /// # Errors
    ///
    /// - `SdkError::Server` if the principal has no access (`server_310`)
    /// - `SdkError::BrokenAccessChain` if a related group is missing
    /// - `SdkError::InvalidState` if the server returns no key generations
    /// - transport, crypto and store errors
    pub fn resolve<'s>(
        &'s mut self,
        group_id: &'s str,
        options: ResolveOptions,
    ) -> BoxFuture<'s, Result<GroupData>> {
        Box::pin(async move {
            let owner = options
                .group_as_member
                .clone()
                .unwrap_or_else(|| self.user.user_id().to_string());

            if let Some(mut cached) = self
                .ctx
                .load::<GroupData>(&StorageKey::group_data(&owner, group_id))
                .await?
            {
                if self.is_stale(&cached) {
                    self.update_check(&mut cached).await?;
                }
                return Ok(cached);
            }

            let request = self
                .group_request(
                    HttpMethod::Get,
                    &format!("api/v1/group/{group_id}"),
                    options.group_as_member.as_deref(),
                )
                .await?;
            let server: GroupServerData = self.ctx.call(request).await?;
            if server.keys.is_empty() {
                return Err(SdkError::InvalidState(format!(
                    "group {group_id} was served without key generations"
                )));
            }

            if let Some(member) = server.access_by_group_as_member.as_deref() {
                if !options.nested {
                    // The connected group's keys unwrap this group's keys.
                    self.resolve(member, ResolveOptions::direct().with_verify(options.verify))
                        .await?;
                }
            }

            let mut from_parent = options.via_parent;
            if server.access_by_parent_group.is_some() {
                from_parent = true;
                let parent = server.parent_group_id.as_deref().ok_or_else(|| {
                    SdkError::BrokenAccessChain(format!(
                        "group {group_id} inherits access but reports no parent"
                    ))
                })?;
                let parent_options = ResolveOptions {
                    via_parent: false,
                    group_as_member: options.group_as_member.clone(),
                    verify: options.verify,
                    nested: true,
                };
                self.resolve(parent, parent_options).await?;
            }

            let mut data = GroupData {
                group_id: server.group_id.clone(),
                parent_group_id: server.parent_group_id.clone(),
                rank: server.rank,
                key_update: server.key_update,
                created_time: server.created_time,
                joined_time: server.joined_time,
                keys: KeyRing::new(),
                from_parent,
                access_by_group_as_member: server.access_by_group_as_member.clone(),
                access_by_parent_group: server.access_by_parent_group.clone(),
                is_connected_group: server.is_connected_group,
                hmac_keys: Vec::new(),
                sortable_keys: Vec::new(),
                last_check_time: now_millis(),
            };

            let keys = self.decrypt_keys(&data, &server.keys, options.verify).await?;
            let full_page = keys.len() >= KEY_PAGE_SIZE;
            data.keys = KeyRing::from_server_order(keys);
            if full_page {
                self.fetch_key_pages(&mut data, options.verify).await?;
            }

            data.hmac_keys = self.decrypt_aux_keys(&mut data, &server.hmac_keys).await?;
            data.sortable_keys = self.decrypt_aux_keys(&mut data, &server.sortable_keys).await?;

            self.save_group(&data).await?;
            self.cache_public_key(&data.group_id, data.newest_key()?)
                .await?;

            info!(
                "resolved group {group_id} ({} key generations, {:?})",
                data.keys.len(),
                data.access_path()?
            );
            Ok(data)
        })
    }

    /// Refreshes rank and the key update flag of a snapshot and stores it.
    ///
    /// # Errors
    ///
    /// Returns transport, server or store errors.
    pub async fn update_check(&mut self, data: &mut GroupData) -> Result<()> {
        let request = self
            .group_request(
                HttpMethod::Get,
                &format!("api/v1/group/{}/update_check", data.group_id),
                data.access_by_group_as_member.as_deref(),
            )
            .await?;
        let check: GroupUpdateCheck = self.ctx.call(request).await?;

        data.rank = check.rank;
        data.key_update = check.key_update;
        data.last_check_time = now_millis();
        self.save_group(data).await
    }

    fn is_stale(&self, data: &GroupData) -> bool {
        let ttl = i64::try_from(self.ctx.config.group_check_ttl.as_millis()).unwrap_or(i64::MAX);
        data.last_check_time.saturating_add(ttl) <= now_millis()
    }

    async fn fetch_key_pages(&mut self, data: &mut GroupData, verify: VerifyLevel) -> Result<()> {
        let Some(last) = data.keys.last() else {
            return Ok(());
        };
        let mut cursor = ListCursor::after(last.time, last.group_key_id.clone());

        loop {
            let request = self
                .group_request(
                    HttpMethod::Get,
                    &format!("api/v1/group/{}/keys/{}", data.group_id, cursor.path()),
                    data.access_by_group_as_member.as_deref(),
                )
                .await?;
            let fetched: Vec<FetchedGroupKey> = self.ctx.call(request).await?;
            let keys = self.decrypt_keys(data, &fetched, verify).await?;

            let Some(last) = keys.last() else {
                break;
            };
            cursor = ListCursor::after(last.time, last.group_key_id.clone());
            debug!(
                "fetched {} more keys of group {}",
                keys.len(),
                data.group_id
            );
            for key in keys {
                data.keys.push(key);
            }

            if fetched.len() < KEY_PAGE_SIZE {
                break;
            }
        }
        Ok(())
    }

    async fn decrypt_aux_keys(
        &mut self,
        data: &mut GroupData,
        fetched: &[FetchedAuxKey],
    ) -> Result<Vec<String>> {
        let mut keys = Vec::with_capacity(fetched.len());
        for aux in fetched {
            let group_key = self
                .get_group_key(data, &aux.group_key_id, false, VerifyLevel::Off)
                .await?;
            keys.push(
                self.ctx
                    .crypto
                    .decrypt_aux_key(&group_key.group_key, &aux.key_data)?,
            );
        }
        Ok(keys)
    }

    // ==================== Keys ====================

    /// Unwraps key copies with the private keys of `data`'s access path.
    ///
    /// With a verify level other than [`VerifyLevel::Off`], copies that name
    /// a signer are checked against the signer's verify key.
    ///
    /// # Errors
    ///
    /// Returns resolution, crypto or (strict verification) fetch errors.
    pub async fn decrypt_keys(
        &mut self,
        data: &GroupData,
        fetched: &[FetchedGroupKey],
        verify: VerifyLevel,
    ) -> Result<Vec<GroupKey>> {
        let mut keys = Vec::with_capacity(fetched.len());
        for fetched_key in fetched {
            let private_key = self.private_key(data, &fetched_key.private_key_id).await?;
            let verify_key = self.signer_verify_key(fetched_key, verify).await?;
            keys.push(self.ctx.crypto.decrypt_group_key(
                &private_key,
                &fetched_key.key_data,
                verify_key.as_deref(),
            )?);
        }
        Ok(keys)
    }

    async fn signer_verify_key(
        &self,
        key: &FetchedGroupKey,
        verify: VerifyLevel,
    ) -> Result<Option<String>> {
        let (Some(user_id), Some(key_id)) = (
            key.signed_by_user_id.as_deref(),
            key.signed_by_user_sign_key_id.as_deref(),
        ) else {
            return Ok(None);
        };

        match verify {
            VerifyLevel::Off => Ok(None),
            VerifyLevel::Tolerant => {
                match directory::user_verify_key(self.ctx, user_id, key_id).await {
                    Ok(verify_key) => Ok(Some(verify_key)),
                    Err(e) => {
                        warn!("unwrapping without verification, verify key of {user_id} unavailable: {e}");
                        Ok(None)
                    }
                }
            }
            VerifyLevel::Strict => {
                match directory::user_verify_key(self.ctx, user_id, key_id).await {
                    Ok(verify_key) => Ok(Some(verify_key)),
                    Err(e) if e.is_server_code(SERVER_IDENTITY_NOT_FOUND) => {
                        warn!("signer {user_id} no longer exists, unwrapping without verification");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Returns the generation `key_id` of `data`'s group, fetching and
    /// unwrapping it if it is not stored yet.
    ///
    /// With `mark_newest`, the generation becomes the newest one unless a
    /// later generation already is, and the group public key cache follows.
    /// The snapshot is stored whenever it changes.
    ///
    /// # Errors
    ///
    /// - `SdkError::Server` if the server has no copy for this principal
    ///   (`server_304`)
    /// - `SdkError::KeyNotFound` if the generation is still missing after
    ///   the fetch
    pub async fn get_group_key(
        &mut self,
        data: &mut GroupData,
        key_id: &str,
        mark_newest: bool,
        verify: VerifyLevel,
    ) -> Result<GroupKey> {
        let mut changed = false;

        if !data.keys.contains(key_id) {
            let request = self
                .group_request(
                    HttpMethod::Get,
                    &format!("api/v1/group/{}/key/{key_id}", data.group_id),
                    data.access_by_group_as_member.as_deref(),
                )
                .await?;
            let fetched: FetchedGroupKey = self.ctx.call(request).await?;
            let keys = self
                .decrypt_keys(data, std::slice::from_ref(&fetched), verify)
                .await?;
            for key in keys {
                debug!("learned generation {} of group {}", key.group_key_id, data.group_id);
                data.keys.push(key);
                changed = true;
            }
        }

        if mark_newest && data.keys.mark_newest(key_id) {
            if let Some(key) = data.keys.get(key_id) {
                self.cache_public_key(&data.group_id, key).await?;
            }
            changed = true;
        }

        if changed {
            self.save_group(data).await?;
        }

        data.keys.get(key_id).cloned().ok_or_else(|| {
            SdkError::KeyNotFound(format!(
                "generation {key_id} of group {}; finishing the key rotation may help",
                data.group_id
            ))
        })
    }

    /// Returns the private key with id `key_id` along `data`'s access path.
    ///
    /// # Errors
    ///
    /// - `SdkError::BrokenAccessChain` if the parent or connected group is
    ///   not stored
    /// - errors of fetching the key generation
    pub fn private_key<'s>(
        &'s mut self,
        data: &'s GroupData,
        key_id: &'s str,
    ) -> BoxFuture<'s, Result<String>> {
        Box::pin(async move {
            match data.access_path()? {
                AccessPath::Direct => self.user.private_key(key_id).await,
                AccessPath::ViaParent {
                    parent_group_id,
                    as_member,
                } => {
                    let owner = as_member.unwrap_or_else(|| self.user.user_id().to_string());
                    let mut parent = self.related_group(&owner, &parent_group_id).await?;
                    let key = self
                        .get_group_key(&mut parent, key_id, false, VerifyLevel::Off)
                        .await?;
                    Ok(key.private_group_key.clone())
                }
                AccessPath::ViaConnectedGroup { member_group_id } => {
                    let owner = self.user.user_id().to_string();
                    let mut connected = self.related_group(&owner, &member_group_id).await?;
                    let key = self
                        .get_group_key(&mut connected, key_id, false, VerifyLevel::Off)
                        .await?;
                    Ok(key.private_group_key.clone())
                }
            }
        })
    }

    /// Returns the newest public key along `data`'s access path and its id.
    ///
    /// # Errors
    ///
    /// - `SdkError::BrokenAccessChain` if the parent or connected group is
    ///   not stored
    /// - `SdkError::InvalidState` if the key owner has no newest generation
    pub async fn public_key(&mut self, data: &GroupData) -> Result<(String, String)> {
        match data.access_path()? {
            AccessPath::Direct => {
                let key = self.user.newest_key()?;
                Ok((key.public_key.clone(), key.group_key_id.clone()))
            }
            AccessPath::ViaParent {
                parent_group_id,
                as_member,
            } => {
                let owner = as_member.unwrap_or_else(|| self.user.user_id().to_string());
                let parent = self.related_group(&owner, &parent_group_id).await?;
                let key = parent.newest_key()?;
                Ok((key.public_group_key.clone(), key.group_key_id.clone()))
            }
            AccessPath::ViaConnectedGroup { member_group_id } => {
                let owner = self.user.user_id().to_string();
                let connected = self.related_group(&owner, &member_group_id).await?;
                let key = connected.newest_key()?;
                Ok((key.public_group_key.clone(), key.group_key_id.clone()))
            }
        }
    }

    // ==================== Store ====================

    async fn related_group(&self, owner: &str, group_id: &str) -> Result<GroupData> {
        self.ctx
            .load(&StorageKey::group_data(owner, group_id))
            .await?
            .ok_or_else(|| {
                SdkError::BrokenAccessChain(format!(
                    "group {group_id} is not stored for {owner}; fetch it again"
                ))
            })
    }

    /// Stores a snapshot under its owner.
    pub(crate) async fn save_group(&self, data: &GroupData) -> Result<()> {
        let key = StorageKey::group_data(data.owner_id(self.user.user_id()), &data.group_id);
        self.ctx.save(&key, data).await
    }

    async fn cache_public_key(&self, group_id: &str, key: &GroupKey) -> Result<()> {
        self.ctx
            .save(
                &StorageKey::group_public_key(group_id),
                &GroupPublicKeyData {
                    public_key: key.exported_public_key.clone(),
                    public_key_id: key.group_key_id.clone(),
                },
            )
            .await
    }

    async fn group_request(
        &mut self,
        method: HttpMethod,
        path: &str,
        group_as_member: Option<&str>,
    ) -> Result<Request> {
        let jwt = self.user.jwt().await?;
        Ok(self
            .ctx
            .request(method, path)
            .with_jwt(jwt)
            .with_group_as_member(group_as_member))
    }
}
