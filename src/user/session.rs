//! Session of a logged in user on one device.

use log::{debug, info};

use super::types::{DeviceKeys, UserData, UserKey};
use crate::config::{RefreshMode, JWT_REFRESH_LEEWAY_SECS};
use crate::context::Context;
use crate::directory;
use crate::error::{Result, SdkError};
use crate::group::invite::{self, PageUpload};
use crate::group::{GroupSession, KeyUploadReport};
use crate::keygraph::{KeyGraphResolver, ResolveOptions, RotationCoordinator, RotationReport};
use crate::net::types::{
    cursor_after, DeviceRegistration, FetchedUserKey, GroupCreated, GroupInviteListItem,
    GroupListItem, KeySessionOutput, RefreshInput, RefreshOutput, UserDeviceListItem,
};
use crate::net::HttpMethod;
use crate::store::StorageKey;
use crate::sym_key::{self, SymKey};

/// A user logged in on this device.
///
/// The session owns the user's [`UserData`] and persists it after every
/// mutation. Groups are opened with [`get_group`](Self::get_group) and act
/// through the session that opened them.
pub struct UserSession {
    ctx: Context,
    device_identifier: String,
    data: UserData,
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("device_identifier", &self.device_identifier)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl UserSession {
    pub(crate) fn new(ctx: Context, device_identifier: impl Into<String>, data: UserData) -> Self {
        Self {
            ctx,
            device_identifier: device_identifier.into(),
            data,
        }
    }

    // ==================== Accessors ====================

    /// User id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.data.user_id
    }

    /// Device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.data.device_id
    }

    /// Identifier the session is stored under.
    #[must_use]
    pub fn device_identifier(&self) -> &str {
        &self.device_identifier
    }

    /// Multi factor auth is enabled for the account.
    #[must_use]
    pub const fn mfa(&self) -> bool {
        self.data.mfa
    }

    /// Stored session state.
    #[must_use]
    pub const fn data(&self) -> &UserData {
        &self.data
    }

    /// Shared collaborators.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.ctx
    }

    /// Keys of this device.
    #[must_use]
    pub const fn device(&self) -> &DeviceKeys {
        &self.data.device
    }

    /// Persists the session state.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn save(&self) -> Result<()> {
        self.ctx
            .save(&StorageKey::user_data(&self.device_identifier), &self.data)
            .await
    }

    // ==================== JWT ====================

    /// Returns a JWT valid for at least the refresh leeway, refreshing it
    /// first if needed.
    ///
    /// # Errors
    ///
    /// Returns decoding, refresh or store errors.
    pub async fn jwt(&mut self) -> Result<String> {
        let claims = self.ctx.crypto.decode_jwt(&self.data.jwt)?;
        if claims.exp > chrono::Utc::now().timestamp() + JWT_REFRESH_LEEWAY_SECS {
            return Ok(self.data.jwt.clone());
        }

        let jwt = match &self.ctx.config.refresh {
            RefreshMode::Api => {
                let body = serde_json::to_string(&RefreshInput {
                    refresh_token: self.data.refresh_token.clone(),
                })?;
                let output: RefreshOutput = self
                    .ctx
                    .call(
                        self.ctx
                            .request(HttpMethod::Post, "api/v1/refresh")
                            .with_body(body)
                            .with_jwt(self.data.jwt.clone()),
                    )
                    .await?;
                output.jwt
            }
            RefreshMode::External(refresher) => refresher.refresh(&self.data.jwt).await?,
        };

        debug!("refreshed jwt of user {}", self.data.user_id);
        self.data.jwt.clone_from(&jwt);
        self.save().await?;
        Ok(jwt)
    }

    // ==================== User Keys ====================

    /// Returns user key generation `key_id`, fetching and unwrapping an older
    /// generation with the device key if it is not stored yet.
    ///
    /// With `mark_newest`, the generation becomes the newest one unless a
    /// later generation already is.
    ///
    /// # Errors
    ///
    /// - `SdkError::Server` if the server has no copy for this device
    /// - `SdkError::KeyNotFound` if the generation is still missing
    pub async fn user_key(&mut self, key_id: &str, mark_newest: bool) -> Result<UserKey> {
        let mut changed = false;

        if !self.data.user_keys.contains(key_id) {
            let jwt = self.jwt().await?;
            let fetched: FetchedUserKey = self
                .ctx
                .call(
                    self.ctx
                        .request(
                            HttpMethod::Get,
                            &format!("api/v1/user/user_keys/key/{key_id}"),
                        )
                        .with_jwt(jwt),
                )
                .await?;
            let key = self
                .ctx
                .crypto
                .decrypt_user_key(&self.data.device.private_key, &fetched.key_data)?;
            debug!("learned user key generation {}", key.group_key_id);
            self.data.user_keys.push(key);
            changed = true;
        }

        if mark_newest && self.data.user_keys.mark_newest(key_id) {
            changed = true;
        }
        if changed {
            self.save().await?;
        }

        self.data
            .user_keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| SdkError::KeyNotFound(format!("user key generation {key_id}")))
    }

    /// Private key of user key generation `key_id`.
    ///
    /// # Errors
    ///
    /// See [`user_key`](Self::user_key).
    pub async fn private_key(&mut self, key_id: &str) -> Result<String> {
        Ok(self.user_key(key_id, false).await?.private_key.clone())
    }

    /// Newest user key generation.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::InvalidState` if keys exist but none is marked
    /// newest.
    pub fn newest_key(&self) -> Result<&UserKey> {
        self.data.user_keys.newest()
    }

    /// Newest public key and its generation id.
    ///
    /// # Errors
    ///
    /// See [`newest_key`](Self::newest_key).
    pub fn newest_public_key(&self) -> Result<(&str, &str)> {
        let key = self.newest_key()?;
        Ok((key.public_key.as_str(), key.group_key_id.as_str()))
    }

    /// Newest sign key.
    ///
    /// # Errors
    ///
    /// See [`newest_key`](Self::newest_key).
    pub fn newest_sign_key(&self) -> Result<&str> {
        Ok(&self.newest_key()?.sign_key)
    }

    fn sign_key_if(&self, sign: bool) -> Result<Option<String>> {
        if sign {
            Ok(Some(self.newest_sign_key()?.to_string()))
        } else {
            Ok(None)
        }
    }

    // ==================== Key Rotation ====================

    /// Starts a rotation of the user keys. The new generation becomes the
    /// newest one on this device right away.
    ///
    /// # Errors
    ///
    /// Returns crypto, transport or server errors.
    pub async fn start_key_rotation(&mut self) -> Result<UserKey> {
        let ctx = self.ctx.clone();
        let mut resolver = KeyGraphResolver::new(&ctx, self);
        RotationCoordinator::new(&mut resolver)
            .start_user_rotation()
            .await
    }

    /// Applies the user key rotation backlog on this device.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn finish_key_rotation(&mut self) -> Result<RotationReport> {
        let ctx = self.ctx.clone();
        let mut resolver = KeyGraphResolver::new(&ctx, self);
        RotationCoordinator::new(&mut resolver)
            .finish_user_rotation()
            .await
    }

    // ==================== Groups ====================

    /// Creates a group with the user as its creator (rank 0).
    ///
    /// # Errors
    ///
    /// Returns crypto, transport or server errors.
    pub async fn create_group(&mut self, sign: bool) -> Result<String> {
        let sign_key = self.sign_key_if(sign)?;
        let body = self.ctx.crypto.prepare_create_group(
            &self.newest_key()?.public_key,
            sign_key.as_deref(),
            &self.data.user_id,
        )?;

        let jwt = self.jwt().await?;
        let created: GroupCreated = self
            .ctx
            .call(
                self.ctx
                    .request(HttpMethod::Post, "api/v1/group")
                    .with_body(body)
                    .with_jwt(jwt),
            )
            .await?;
        info!("created group {}", created.group_id);
        Ok(created.group_id)
    }

    /// Opens a group, directly or as the connected group `group_as_member`.
    ///
    /// # Errors
    ///
    /// - `SdkError::Server` with `server_310` without access
    /// - resolution errors
    pub async fn get_group(
        &mut self,
        group_id: &str,
        group_as_member: Option<&str>,
    ) -> Result<GroupSession> {
        let options = group_as_member.map_or_else(ResolveOptions::direct, |id| ResolveOptions::as_member(id));
        self.get_group_with(group_id, options).await
    }

    /// Opens a group with explicit resolution options.
    ///
    /// # Errors
    ///
    /// See [`get_group`](Self::get_group).
    pub async fn get_group_with(
        &mut self,
        group_id: &str,
        options: ResolveOptions,
    ) -> Result<GroupSession> {
        let ctx = self.ctx.clone();
        let data = KeyGraphResolver::new(&ctx, self)
            .resolve(group_id, options)
            .await?;
        Ok(GroupSession::new(ctx, data))
    }

    /// Groups the user is a member of, one page after `last`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn groups(&mut self, last: Option<&GroupListItem>) -> Result<Vec<GroupListItem>> {
        let path = format!("api/v1/group/all/{}", cursor_after(last).path());
        self.get(&path).await
    }

    /// Pending group invites, one page after `last`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn group_invites(
        &mut self,
        last: Option<&GroupInviteListItem>,
    ) -> Result<Vec<GroupInviteListItem>> {
        let path = format!("api/v1/group/invite/{}", cursor_after(last).path());
        self.get(&path).await
    }

    /// Accepts an invite to `group_id`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn accept_group_invite(&mut self, group_id: &str) -> Result<()> {
        self.send(HttpMethod::Patch, &format!("api/v1/group/{group_id}/invite"))
            .await
    }

    /// Rejects an invite to `group_id`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn reject_group_invite(&mut self, group_id: &str) -> Result<()> {
        self.send(HttpMethod::Delete, &format!("api/v1/group/{group_id}/invite"))
            .await
    }

    /// Asks to join `group_id`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn join_request(&mut self, group_id: &str) -> Result<()> {
        self.send(HttpMethod::Patch, &format!("api/v1/group/{group_id}/join_req"))
            .await
    }

    /// Join requests the user sent, one page after `last`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn sent_join_requests(
        &mut self,
        last: Option<&GroupInviteListItem>,
    ) -> Result<Vec<GroupInviteListItem>> {
        let path = format!("api/v1/group/joins/{}", cursor_after(last).path());
        self.get(&path).await
    }

    /// Withdraws a join request.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn delete_join_request(&mut self, group_id: &str) -> Result<()> {
        self.send(HttpMethod::Delete, &format!("api/v1/group/joins/{group_id}"))
            .await
    }

    /// Devices of the user, one page after `last`.
    ///
    /// # Errors
    ///
    /// Returns transport or server errors.
    pub async fn devices(
        &mut self,
        last: Option<&UserDeviceListItem>,
    ) -> Result<Vec<UserDeviceListItem>> {
        let path = format!("api/v1/user/device/{}", cursor_after(last).path());
        self.get(&path).await
    }

    // ==================== Device Registration ====================

    /// Body carrying page `page` of the user key generations for the device
    /// named by `server_output`, and whether more pages follow.
    ///
    /// # Errors
    ///
    /// Returns decoding or crypto errors.
    pub fn prepare_register_device(
        &self,
        server_output: &str,
        page: usize,
    ) -> Result<(String, bool)> {
        let registration: DeviceRegistration = serde_json::from_str(server_output)?;
        invite::key_page_body(
            &self.ctx,
            &self.data.user_keys,
            &registration.public_key,
            page,
            None,
        )
    }

    /// Hands every user key generation to a new device of this user.
    ///
    /// The first page goes with the registration. When the server opens an
    /// upload session, the remaining pages follow concurrently and failed
    /// pages are reported rather than retried.
    ///
    /// # Errors
    ///
    /// Returns decoding, crypto, transport or server errors of the first
    /// page.
    pub async fn register_device(&mut self, server_output: &str) -> Result<KeyUploadReport> {
        let registration: DeviceRegistration = serde_json::from_str(server_output)?;
        let (body, _) = invite::key_page_body(
            &self.ctx,
            &self.data.user_keys,
            &registration.public_key,
            0,
            None,
        )?;
        let jwt = self.jwt().await?;
        let path = format!("api/v1/user/done_register_device/{}", registration.device_id);
        let output: KeySessionOutput = self
            .ctx
            .call(
                self.ctx
                    .request(HttpMethod::Put, &path)
                    .with_body(body)
                    .with_jwt(jwt.clone()),
            )
            .await?;
        info!(
            "registered device {} of user {}",
            registration.device_id, self.data.user_id
        );

        let Some(session_id) = output.session_id.filter(|id| !id.is_empty()) else {
            return Ok(KeyUploadReport {
                session_id: None,
                uploaded_pages: 1,
                failed_pages: Vec::new(),
            });
        };
        let session_path = format!("api/v1/user/done_register_device/session/{session_id}");
        let target = PageUpload {
            session_path: &session_path,
            owner: &self.data.user_id,
            group_as_member: None,
        };
        let (uploaded, failed_pages) = invite::upload_remaining_pages(
            &self.ctx,
            &jwt,
            &self.data.user_keys,
            &target,
            &registration.public_key,
        )
        .await?;
        Ok(KeyUploadReport {
            session_id: Some(session_id),
            uploaded_pages: uploaded + 1,
            failed_pages,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&mut self, path: &str) -> Result<T> {
        let jwt = self.jwt().await?;
        self.ctx
            .call(self.ctx.request(HttpMethod::Get, path).with_jwt(jwt))
            .await
    }

    async fn send(&mut self, method: HttpMethod, path: &str) -> Result<()> {
        let jwt = self.jwt().await?;
        self.ctx
            .call_general(self.ctx.request(method, path).with_jwt(jwt))
            .await
    }

    // ==================== Asymmetric Payloads ====================

    /// Encrypts bytes for `reply_id` with the user's published public key.
    ///
    /// # Errors
    ///
    /// Returns lookup or crypto errors.
    pub async fn encrypt(&self, reply_id: &str, data: &[u8], sign: bool) -> Result<Vec<u8>> {
        let public_key = directory::user_public_key(&self.ctx, reply_id).await?;
        let sign_key = self.sign_key_if(sign)?;
        Ok(self
            .ctx
            .crypto
            .encrypt_asymmetric(&public_key.public_key, data, sign_key.as_deref())?)
    }

    /// String form of [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns lookup or crypto errors.
    pub async fn encrypt_string(&self, reply_id: &str, data: &str, sign: bool) -> Result<String> {
        let public_key = directory::user_public_key(&self.ctx, reply_id).await?;
        let sign_key = self.sign_key_if(sign)?;
        Ok(self.ctx.crypto.encrypt_string_asymmetric(
            &public_key.public_key,
            data,
            sign_key.as_deref(),
        )?)
    }

    /// Decrypts bytes addressed to this user. With `verify_with`, a signed
    /// payload is checked against that user's verify key.
    ///
    /// # Errors
    ///
    /// Returns key, lookup or crypto errors.
    pub async fn decrypt(&mut self, data: &[u8], verify_with: Option<&str>) -> Result<Vec<u8>> {
        let head = self.ctx.crypto.split_head(data)?;
        let private_key = self.private_key(&head.id).await?;
        let verify_key = self.sender_verify_key(head.sign.as_ref(), verify_with).await?;
        Ok(self
            .ctx
            .crypto
            .decrypt_asymmetric(&private_key, data, verify_key.as_deref())?)
    }

    /// String form of [`decrypt`](Self::decrypt).
    ///
    /// # Errors
    ///
    /// Returns key, lookup or crypto errors.
    pub async fn decrypt_string(&mut self, data: &str, verify_with: Option<&str>) -> Result<String> {
        let head = self.ctx.crypto.split_head_string(data)?;
        let private_key = self.private_key(&head.id).await?;
        let verify_key = self.sender_verify_key(head.sign.as_ref(), verify_with).await?;
        Ok(self
            .ctx
            .crypto
            .decrypt_string_asymmetric(&private_key, data, verify_key.as_deref())?)
    }

    pub(crate) async fn sender_verify_key(
        &self,
        sign: Option<&crate::crypto::SignHead>,
        verify_with: Option<&str>,
    ) -> Result<Option<String>> {
        match (sign, verify_with) {
            (Some(sign), Some(user_id)) => Ok(Some(
                directory::user_verify_key(&self.ctx, user_id, &sign.id).await?,
            )),
            _ => Ok(None),
        }
    }

    /// Safety number of this user's newest verify key, combined with the
    /// verify key `key_id` of `other` when given as `(user_id, key_id)`.
    /// Two users who compute it for each other get the same number.
    ///
    /// # Errors
    ///
    /// Returns key, lookup or crypto errors.
    pub async fn create_safety_number(&self, other: Option<(&str, &str)>) -> Result<String> {
        let own = self.newest_key()?;
        let other_key = match other {
            Some((user_id, key_id)) => {
                Some((user_id, directory::user_verify_key(&self.ctx, user_id, key_id).await?))
            }
            None => None,
        };
        Ok(self.ctx.crypto.create_safety_number(
            (self.data.user_id.as_str(), own.verify_key.as_str()),
            other_key.as_ref().map(|(id, key)| (*id, key.as_str())),
        )?)
    }

    // ==================== Standalone Keys ====================

    /// Creates a key wrapped by the newest user key without registering it.
    /// Returns the key and the wrapped blob.
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
        master_key_id: &str,
        wrapped: &str,
    ) -> Result<SymKey> {
        let master = self.user_key(master_key_id, false).await?;
        sym_key::decrypt_non_registered(&self.ctx, &master.group_key, master_key_id, wrapped)
    }

    /// Registers a key wrapped by the newest user key.
    ///
    /// # Errors
    ///
    /// Returns key, crypto, transport or server errors.
    pub async fn generate_key(&mut self) -> Result<SymKey> {
        let master = self.newest_key()?.group_key.clone();
        let jwt = self.jwt().await?;
        let data = sym_key::register(&self.ctx, jwt, &master).await?;
        sym_key::open(&self.ctx, &master, &data)
    }

    /// Fetches and unwraps a registered key wrapped by one of the user keys.
    ///
    /// # Errors
    ///
    /// Returns key, crypto, transport or server errors.
    pub async fn fetch_key(&mut self, key_id: &str) -> Result<SymKey> {
        let jwt = self.jwt().await?;
        let data = sym_key::fetch(&self.ctx, jwt, key_id).await?;
        let master = self.user_key(&data.master_key_id, false).await?;
        sym_key::open(&self.ctx, &master.group_key, &data)
    }

    /// Deletes a registered key.
    ///
    /// # Errors
    ///
    /// Returns transport, server or store errors.
    pub async fn delete_key(&mut self, key_id: &str) -> Result<()> {
        let jwt = self.jwt().await?;
        sym_key::delete(&self.ctx, jwt, key_id).await
    }

    // ==================== Logout ====================

    /// Deletes the local session state and the actual user pointer.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn logout(self) -> Result<()> {
        self.ctx
            .remove(&StorageKey::user_data(&self.device_identifier))
            .await?;
        self.ctx.remove(&StorageKey::actual_user()).await?;
        info!("logged out user {}", self.data.user_id);
        Ok(())
    }
}
