//! Reusable test helpers: an in-process key server and session builders.
//!
//! [`FakeKeyServer`] implements [`Transport`] and keeps every record in
//! memory. It plays the server side of `DefaultCrypto`: it stores the wire
//! records clients upload, hands every principal its own key copies, prepares
//! rotation records per member and answers with the JSON envelope. No crypto
//! is mocked.
//!
//! Registration is outside the SDK, so users are registered on the server
//! directly and turned into sessions with [`Client::restore_user`].

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use keyweave_core::crypto::wire::{
    CreateGroupInput, DoneKeyRotationInput, GroupKeyData, KeyRotationInput,
    KeyRotationServerOutput, NewMemberKeysInput, RegisterSymKeyInput, UserKeyData,
};
use keyweave_core::crypto::{CryptoProvider, DefaultCrypto, JwtClaims};
use keyweave_core::error::{
    SERVER_IDENTITY_NOT_FOUND, SERVER_KEY_NOT_DECRYPTABLE, SERVER_NO_GROUP_ACCESS,
};
use keyweave_core::keygraph::RotationRecord;
use keyweave_core::net::types::{
    ChangeRankInput, DeviceRegistration, FetchedAuxKey, FetchedGroupKey, FetchedUserKey,
    GroupChildrenListItem, GroupCreated, GroupInviteListItem, GroupJoinReqListItem,
    GroupListItem, GroupPublicKeyData, GroupServerData, GroupUpdateCheck, GroupUserListItem,
    KeyRotationStarted, KeySessionOutput, MemberType, RefreshInput, RefreshOutput,
    SymKeyRegistered, SymKeyServerData, UserDeviceListItem, UserPublicKeyData,
    UserVerifyKeyData,
};
use keyweave_core::net::{HttpMethod, Request, ServerOutput, Transport};
use keyweave_core::user::{DeviceKeys, LoginData, UserSession};
use keyweave_core::{Client, SdkConfig, SdkError};

/// Base url every test client talks to.
pub const BASE_URL: &str = "http://keys.test";
/// Application token of the test clients.
pub const APP_TOKEN: &str = "test-app-token";

/// The JWT is missing, malformed, expired or names an unknown device.
pub const SERVER_INVALID_JWT: u32 = 30;
/// The acting principal's rank is too low (server side check).
pub const SERVER_NO_RANK: u32 = 302;
/// The group does not accept invites or join requests.
pub const SERVER_INVITES_CLOSED: u32 = 312;
/// The request names records that do not fit together.
pub const SERVER_BAD_REQUEST: u32 = 400;
/// No route for the request.
pub const SERVER_NO_ROUTE: u32 = 404;
/// A session upload was made to fail.
pub const SERVER_UPLOAD_FAILED: u32 = 500;
/// A directory lookup was made to fail.
pub const SERVER_UNAVAILABLE: u32 = 503;

const CRYPTO: DefaultCrypto = DefaultCrypto::new();
const PAGE_SIZE: usize = 50;
const DEFAULT_MEMBER_RANK: i32 = 4;
const JWT_LIFETIME_SECS: i64 = 3600;

type Failure = (u32, String);
type Out<T> = std::result::Result<T, Failure>;
type Reply = Out<Value>;

fn reply<T: Serialize>(value: &T) -> Reply {
    serde_json::to_value(value).map_err(internal)
}

#[allow(clippy::unnecessary_wraps)]
const fn done() -> Reply {
    Ok(Value::Null)
}

fn body<T: DeserializeOwned>(request: &Request) -> Out<T> {
    let text = request
        .body
        .as_deref()
        .ok_or_else(|| bad("missing body"))?;
    serde_json::from_str(text).map_err(|e| bad(&format!("invalid body: {e}")))
}

fn bad(message: &str) -> Failure {
    (SERVER_BAD_REQUEST, message.to_string())
}

fn internal(e: impl std::fmt::Display) -> Failure {
    (SERVER_UPLOAD_FAILED, e.to_string())
}

fn no_access(group_id: &str) -> Failure {
    (
        SERVER_NO_GROUP_ACCESS,
        format!("no access to group {group_id}"),
    )
}

fn not_found(id: &str) -> Failure {
    (SERVER_IDENTITY_NOT_FOUND, format!("{id} not found"))
}

fn no_rank() -> Failure {
    (SERVER_NO_RANK, "rank too low".to_string())
}

fn no_copy(key_id: &str) -> Failure {
    (
        SERVER_KEY_NOT_DECRYPTABLE,
        format!("no key copy of {key_id} for this principal"),
    )
}

/// Items after the cursor `(time, id)`, ascending, one page.
fn page_after<T>(mut items: Vec<(u64, String, T)>, time: &str, id: &str) -> Vec<T> {
    let cursor = (time.parse::<u64>().unwrap_or(0), id.to_string());
    items.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    items
        .into_iter()
        .filter(|(t, i, _)| (*t, i.as_str()) > (cursor.0, cursor.1.as_str()))
        .take(PAGE_SIZE)
        .map(|(_, _, item)| item)
        .collect()
}

fn issue_jwt(user_id: &str, device_id: &str, valid_for_secs: i64) -> String {
    DefaultCrypto::encode_unsigned_jwt(&JwtClaims {
        sub: user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + valid_for_secs,
        device_id: Some(device_id.to_string()),
    })
    .expect("jwt claims encode")
}

fn refresh_token(device_id: &str) -> String {
    format!("refresh-{device_id}")
}

// ==================== Records ====================

/// Order in which rotation backlogs are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogOrder {
    /// Oldest rotation first.
    Oldest,
    /// Newest rotation first.
    Reversed,
    /// Positions of the oldest-first backlog, applied when the lengths match.
    Permuted(&'static [usize]),
}

impl BacklogOrder {
    fn apply(self, records: Vec<RotationRecord>) -> Vec<RotationRecord> {
        match self {
            Self::Oldest => records,
            Self::Reversed => records.into_iter().rev().collect(),
            Self::Permuted(order) if order.len() == records.len() => order
                .iter()
                .filter_map(|i| records.get(*i).cloned())
                .collect(),
            Self::Permuted(_) => records,
        }
    }
}

struct Device {
    id: String,
    identifier: String,
    time: u64,
    keys: DeviceKeys,
}

struct UserGeneration {
    id: String,
    time: u64,
    encrypted_private_key: String,
    public_key: String,
    encrypted_sign_key: String,
    verify_key: String,
    public_key_sig: String,
    /// Device id to (wrapped user key, device key id).
    copies: HashMap<String, (String, String)>,
}

impl UserGeneration {
    fn from_key_data(data: UserKeyData, device_id: &str) -> Self {
        let mut copies = HashMap::new();
        copies.insert(
            device_id.to_string(),
            (data.encrypted_group_key, data.device_key_id),
        );
        Self {
            id: data.group_key_id,
            time: data.time,
            encrypted_private_key: data.encrypted_private_key,
            public_key: data.public_key,
            encrypted_sign_key: data.encrypted_sign_key,
            verify_key: data.verify_key,
            public_key_sig: data.public_key_sig,
            copies,
        }
    }

    fn key_data(&self, device_id: &str) -> Option<UserKeyData> {
        self.copies
            .get(device_id)
            .map(|(encrypted_group_key, device_key_id)| UserKeyData {
                group_key_id: self.id.clone(),
                time: self.time,
                encrypted_group_key: encrypted_group_key.clone(),
                device_key_id: device_key_id.clone(),
                encrypted_private_key: self.encrypted_private_key.clone(),
                public_key: self.public_key.clone(),
                encrypted_sign_key: self.encrypted_sign_key.clone(),
                verify_key: self.verify_key.clone(),
                public_key_sig: self.public_key_sig.clone(),
            })
    }
}

struct User {
    id: String,
    devices: Vec<Device>,
    /// Devices that signed in but hold no user keys yet.
    pending_devices: Vec<Device>,
    /// Upload session id to the device being registered.
    device_sessions: HashMap<String, String>,
    /// Oldest first.
    generations: Vec<UserGeneration>,
    /// Device id to pending rotation records.
    rotations: HashMap<String, Vec<RotationRecord>>,
    hmac_key: Option<FetchedAuxKey>,
}

impl User {
    fn generation(&self, key_id: &str) -> Option<&UserGeneration> {
        self.generations.iter().find(|g| g.id == key_id)
    }

    fn store_copies(&mut self, device_id: &str, input: &NewMemberKeysInput) {
        for key in &input.keys {
            if let Some(generation) = self.generations.iter_mut().find(|g| g.id == key.group_key_id) {
                generation.copies.insert(
                    device_id.to_string(),
                    (key.encrypted_group_key.clone(), key.public_key_id.clone()),
                );
            }
        }
    }
}

struct Generation {
    id: String,
    time: u64,
    encrypted_private_group_key: String,
    public_group_key: String,
    group_key_sig: Option<String>,
    signed_by_user_id: Option<String>,
    signed_by_user_sign_key_id: Option<String>,
}

struct KeyCopy {
    private_key_id: String,
    encrypted_group_key: String,
}

#[derive(Clone, Copy)]
struct Membership {
    kind: MemberType,
    rank: i32,
    time: u64,
}

struct Group {
    id: String,
    parent: Option<String>,
    created_time: u64,
    is_connected_group: bool,
    invites_open: bool,
    /// Oldest first.
    generations: Vec<Generation>,
    members: BTreeMap<String, Membership>,
    /// Key holder to (generation id to copy).
    copies: HashMap<String, HashMap<String, KeyCopy>>,
    /// Key holder to pending rotation records.
    rotations: HashMap<String, Vec<RotationRecord>>,
    hmac_keys: Vec<FetchedAuxKey>,
    sortable_keys: Vec<FetchedAuxKey>,
    invites: BTreeMap<String, Membership>,
    join_requests: BTreeMap<String, Membership>,
    /// Upload session id to key holder.
    sessions: HashMap<String, String>,
}

impl Group {
    fn new(
        id: String,
        parent: Option<String>,
        time: u64,
        generation_id: String,
        key_holder: &str,
        input: CreateGroupInput,
    ) -> Self {
        let mut copies: HashMap<String, HashMap<String, KeyCopy>> = HashMap::new();
        copies.entry(key_holder.to_string()).or_default().insert(
            generation_id.clone(),
            KeyCopy {
                private_key_id: input.creator_public_key_id,
                encrypted_group_key: input.encrypted_group_key,
            },
        );
        Self {
            id,
            parent,
            created_time: time,
            is_connected_group: false,
            invites_open: true,
            hmac_keys: vec![FetchedAuxKey {
                group_key_id: generation_id.clone(),
                key_data: input.encrypted_hmac_key,
            }],
            sortable_keys: vec![FetchedAuxKey {
                group_key_id: generation_id.clone(),
                key_data: input.encrypted_sortable_key,
            }],
            generations: vec![Generation {
                id: generation_id,
                time,
                encrypted_private_group_key: input.encrypted_private_group_key,
                public_group_key: input.public_group_key,
                group_key_sig: input.group_key_sig,
                signed_by_user_id: input.signed_by_user_id,
                signed_by_user_sign_key_id: input.signed_by_user_sign_key_id,
            }],
            members: BTreeMap::new(),
            copies,
            rotations: HashMap::new(),
            invites: BTreeMap::new(),
            join_requests: BTreeMap::new(),
            sessions: HashMap::new(),
        }
    }

    fn generation(&self, key_id: &str) -> Option<&Generation> {
        self.generations.iter().find(|g| g.id == key_id)
    }

    fn fetched_key(generation: &Generation, copy: &KeyCopy) -> Out<FetchedGroupKey> {
        let key_data = serde_json::to_string(&GroupKeyData {
            group_key_id: generation.id.clone(),
            time: generation.time,
            encrypted_group_key: copy.encrypted_group_key.clone(),
            encrypted_private_group_key: generation.encrypted_private_group_key.clone(),
            public_group_key: generation.public_group_key.clone(),
            group_key_sig: generation.group_key_sig.clone(),
        })
        .map_err(internal)?;
        Ok(FetchedGroupKey {
            private_key_id: copy.private_key_id.clone(),
            key_data,
            signed_by_user_id: generation.signed_by_user_id.clone(),
            signed_by_user_sign_key_id: generation.signed_by_user_sign_key_id.clone(),
        })
    }

    /// Copies of `holder`, newest first, one page older than `before`.
    fn key_page(&self, holder: &str, before: Option<u64>) -> Out<Vec<FetchedGroupKey>> {
        let Some(copies) = self.copies.get(holder) else {
            return Ok(Vec::new());
        };
        self.generations
            .iter()
            .rev()
            .filter(|g| before.map_or(true, |t| g.time < t))
            .filter_map(|g| copies.get(&g.id).map(|copy| (g, copy)))
            .take(PAGE_SIZE)
            .map(|(g, copy)| Self::fetched_key(g, copy))
            .collect()
    }

    fn key_copy(&self, holder: &str, key_id: &str) -> Out<FetchedGroupKey> {
        let generation = self.generation(key_id).ok_or_else(|| no_copy(key_id))?;
        let copy = self
            .copies
            .get(holder)
            .and_then(|copies| copies.get(key_id))
            .ok_or_else(|| no_copy(key_id))?;
        Self::fetched_key(generation, copy)
    }

    fn store_copies(&mut self, holder: &str, input: &NewMemberKeysInput) {
        for key in &input.keys {
            if self.generation(&key.group_key_id).is_none() {
                continue;
            }
            self.copies.entry(holder.to_string()).or_default().insert(
                key.group_key_id.clone(),
                KeyCopy {
                    private_key_id: key.public_key_id.clone(),
                    encrypted_group_key: key.encrypted_group_key.clone(),
                },
            );
        }
    }

    fn has_rotations(&self, holder: &str) -> bool {
        self.rotations.get(holder).is_some_and(|r| !r.is_empty())
    }

    fn remove_principal(&mut self, principal: &str) {
        self.members.remove(principal);
        self.copies.remove(principal);
        self.rotations.remove(principal);
        self.invites.remove(principal);
        self.join_requests.remove(principal);
    }
}

/// How a principal reaches a group.
struct Access {
    rank: i32,
    joined_time: u64,
    /// Principal whose key copies this access reads.
    key_holder: String,
    /// Ancestor the access is inherited from.
    inherited_from: Option<String>,
}

// ==================== State ====================

struct State {
    clock: u64,
    next_id: u64,
    users: HashMap<String, User>,
    groups: HashMap<String, Group>,
    sym_keys: HashMap<String, SymKeyServerData>,
    backlog_order: BacklogOrder,
    failing_uploads: usize,
    /// Code every verify key lookup fails with.
    failing_verify_keys: Option<u32>,
    refresh_calls: usize,
    requests: Vec<(HttpMethod, String)>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            clock: 1_000,
            next_id: 0,
            users: HashMap::new(),
            groups: HashMap::new(),
            sym_keys: HashMap::new(),
            backlog_order: BacklogOrder::Oldest,
            failing_uploads: 0,
            failing_verify_keys: None,
            refresh_calls: 0,
            requests: Vec::new(),
        }
    }
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:05}", self.next_id)
    }

    fn group(&self, group_id: &str) -> Out<&Group> {
        self.groups.get(group_id).ok_or_else(|| no_access(group_id))
    }

    fn group_mut(&mut self, group_id: &str) -> Out<&mut Group> {
        self.groups
            .get_mut(group_id)
            .ok_or_else(|| no_access(group_id))
    }

    fn user(&self, user_id: &str) -> Out<&User> {
        self.users.get(user_id).ok_or_else(|| not_found(user_id))
    }

    fn user_mut(&mut self, user_id: &str) -> Out<&mut User> {
        self.users.get_mut(user_id).ok_or_else(|| not_found(user_id))
    }

    fn access(&self, group_id: &str, principal: &str) -> Out<Access> {
        let group = self.group(group_id)?;
        if let Some(member) = group.members.get(principal) {
            return Ok(Access {
                rank: member.rank,
                joined_time: member.time,
                key_holder: principal.to_string(),
                inherited_from: None,
            });
        }

        let mut ancestor = group.parent.clone();
        while let Some(id) = ancestor {
            let upper = self.group(&id).map_err(|_| no_access(group_id))?;
            if let Some(member) = upper.members.get(principal) {
                return Ok(Access {
                    rank: member.rank,
                    joined_time: member.time,
                    key_holder: group.parent.clone().unwrap_or_default(),
                    inherited_from: Some(id),
                });
            }
            ancestor = upper.parent.clone();
        }
        Err(no_access(group_id))
    }

    /// The principal a request acts as: the group named by the
    /// group-as-member header, or the user.
    fn principal(&self, request: &Request, user_id: &str) -> Out<String> {
        match request.group_as_member.as_deref() {
            Some(member) => {
                self.access(member, user_id)?;
                Ok(member.to_string())
            }
            None => Ok(user_id.to_string()),
        }
    }

    fn acting_access(&self, request: &Request, group_id: &str, user_id: &str) -> Out<Access> {
        let principal = self.principal(request, user_id)?;
        self.access(group_id, &principal)
    }

    /// Newest exported public key of a user or group and its key id.
    fn newest_public_key(&self, principal: &str) -> Out<(String, String)> {
        if let Some(user) = self.users.get(principal) {
            let generation = user.generations.last().ok_or_else(|| not_found(principal))?;
            let key = DefaultCrypto::export_public_key(&generation.id, &generation.public_key)
                .map_err(internal)?;
            return Ok((key, generation.id.clone()));
        }
        if let Some(group) = self.groups.get(principal) {
            let generation = group.generations.last().ok_or_else(|| not_found(principal))?;
            let key =
                DefaultCrypto::export_public_key(&generation.id, &generation.public_group_key)
                    .map_err(internal)?;
            return Ok((key, generation.id.clone()));
        }
        Err(not_found(principal))
    }

    fn authenticate(&self, request: &Request, allow_expired: bool) -> Out<(String, String)> {
        let invalid = |detail: &str| (SERVER_INVALID_JWT, detail.to_string());
        let jwt = request.jwt.as_deref().ok_or_else(|| invalid("missing jwt"))?;
        let claims = CRYPTO
            .decode_jwt(jwt)
            .map_err(|e| invalid(&e.to_string()))?;
        if !allow_expired && claims.exp <= chrono::Utc::now().timestamp() {
            return Err(invalid("jwt expired"));
        }
        let device_id = claims.device_id.ok_or_else(|| invalid("jwt names no device"))?;
        let user = self.users.get(&claims.sub).ok_or_else(|| invalid("unknown user"))?;
        if !user.devices.iter().any(|d| d.id == device_id) {
            return Err(invalid("unknown device"));
        }
        Ok((claims.sub, device_id))
    }

    fn login_data(&self, user_id: &str, device_id: &str, valid_for_secs: i64) -> LoginData {
        let user = &self.users[user_id];
        let device = user
            .devices
            .iter()
            .find(|d| d.id == device_id)
            .expect("device is registered");
        let user_keys = user
            .generations
            .iter()
            .rev()
            .filter_map(|g| g.key_data(device_id))
            .map(|data| {
                CRYPTO
                    .decrypt_user_key(
                        &device.keys.private_key,
                        &serde_json::to_string(&data).expect("user key data encodes"),
                    )
                    .expect("user key unwraps with the device key")
            })
            .collect();

        LoginData {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            jwt: issue_jwt(user_id, device_id, valid_for_secs),
            refresh_token: refresh_token(device_id),
            mfa: false,
            device: device.keys.clone(),
            user_keys,
            hmac_keys: user.hmac_key.iter().cloned().collect(),
        }
    }

    // ==================== Routing ====================

    fn handle(&mut self, request: &Request) -> Reply {
        use HttpMethod::{Get, Post};

        let path = request
            .url
            .split_once("/api/v1/")
            .map_or("", |(_, path)| path)
            .to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match (request.method, segments.as_slice()) {
            (Get, ["user", user_id, "public_key"]) => self.user_public_key(user_id),
            (Get, ["user", user_id, "verify_key", key_id]) => {
                self.user_verify_key(user_id, key_id)
            }
            (Get, ["group", group_id, "public_key"]) => self.group_public_key(group_id),
            (Post, ["refresh"]) => self.refresh(request),
            _ => {
                let (user_id, device_id) = self.authenticate(request, false)?;
                self.handle_authenticated(request, &segments, &user_id, &device_id)
            }
        }
    }

    fn handle_authenticated(
        &mut self,
        request: &Request,
        segments: &[&str],
        user_id: &str,
        device_id: &str,
    ) -> Reply {
        use HttpMethod::{Delete, Get, Post, Put};

        match (request.method, segments) {
            (Get, ["user", "user_keys", "key", key_id]) => {
                self.user_key(user_id, device_id, key_id)
            }
            (Post, ["user", "user_keys", "rotation"]) => {
                self.start_user_rotation(request, user_id, device_id)
            }
            (Get, ["user", "user_keys", "rotation"]) => {
                self.user_rotation_backlog(user_id, device_id)
            }
            (Put, ["user", "user_keys", "rotation", key_id]) => {
                self.done_user_rotation(request, user_id, device_id, key_id)
            }
            (Get, ["user", "device", time, id]) => self.devices(user_id, time, id),
            (Put, ["user", "done_register_device", "session", session_id]) => {
                self.device_upload_session(request, user_id, session_id)
            }
            (Put, ["user", "done_register_device", new_device]) => {
                self.done_register_device(request, user_id, new_device)
            }
            (Post, ["keys", "sym_key"]) => self.register_sym_key(request),
            (Get, ["keys", "sym_key", key_id]) => self.sym_key(key_id),
            (Delete, ["keys", "sym_key", key_id]) => self.delete_sym_key(key_id),
            (_, ["group", rest @ ..]) => self.handle_group(request, rest, user_id),
            _ => Err((
                SERVER_NO_ROUTE,
                format!("no route for {} {}", request.method, segments.join("/")),
            )),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn handle_group(&mut self, request: &Request, rest: &[&str], user_id: &str) -> Reply {
        use HttpMethod::{Delete, Get, Patch, Post, Put};

        match (request.method, rest) {
            // User level
            (Post, []) => self.create_group(request, user_id),
            (Get, ["all", time, id]) => self.groups_of(user_id, time, id),
            (Get, ["invite", time, id]) => self.invites_of(user_id, time, id),
            (Get, ["joins", time, id]) => self.sent_join_requests_of(user_id, time, id),
            (Delete, ["joins", group_id]) => self.withdraw_join_request(group_id, user_id),
            (Patch, [group_id, "invite"]) => self.accept_invite(group_id, user_id),
            (Delete, [group_id, "invite"]) => self.reject_invite(group_id, user_id),
            (Patch, [group_id, "join_req"]) => {
                self.request_join(group_id, user_id, MemberType::User)
            }

            // Group level
            (Get, [group_id]) => self.group_data(request, group_id, user_id),
            (Delete, [group_id]) => self.delete_group(request, group_id, user_id),
            (Get, [group_id, "update_check"]) => self.update_check(request, group_id, user_id),
            (Get, [group_id, "keys", time, _]) => self.key_page(request, group_id, user_id, time),
            (Get, [group_id, "key", key_id]) => self.key_copy(request, group_id, user_id, key_id),
            (Post, [group_id, "key_rotation"]) => {
                self.start_rotation(request, group_id, user_id)
            }
            (Get, [group_id, "key_rotation"]) => {
                self.rotation_backlog(request, group_id, user_id)
            }
            (Put, [group_id, "key_rotation", key_id]) => {
                self.done_rotation(request, group_id, user_id, key_id)
            }
            (Get, [group_id, "children", time, id]) => {
                self.children(request, group_id, user_id, time, id)
            }
            (Post, [group_id, "child"]) => self.create_related(request, group_id, user_id, false),
            (Post, [group_id, "connected"]) => {
                self.create_related(request, group_id, user_id, true)
            }
            (Get, [group_id, "member", time, id]) => {
                self.members(request, group_id, user_id, time, id)
            }
            (Put, [group_id, "invite" | "join_req", "session", session_id]) => {
                self.upload_session(request, group_id, user_id, session_id)
            }
            (
                Put,
                [group_id, route @ ("invite" | "invite_auto" | "invite_group" | "invite_group_auto"
                | "re_invite" | "re_invite_group"), target],
            ) => self.add_member(request, group_id, user_id, route, target),
            (Get, [group_id, "join_req", time, id]) => {
                self.join_requests(request, group_id, user_id, time, id)
            }
            (Put, [group_id, "join_req", member_id]) => {
                self.accept_join_request(request, group_id, user_id, member_id)
            }
            (Delete, [group_id, "join_req", member_id]) => {
                self.reject_join_request(request, group_id, user_id, member_id)
            }
            (Patch, [group_id, "change_invite"]) => {
                self.stop_invites(request, group_id, user_id)
            }
            (Put, [group_id, "change_rank"]) => self.change_rank(request, group_id, user_id),
            (Delete, [group_id, "kick", member_id]) => {
                self.kick(request, group_id, user_id, member_id)
            }
            (Delete, [group_id, "leave"]) => self.leave(request, group_id, user_id),

            // A group acting as a member of other groups
            (Patch, [group_id, "join_req", target]) => {
                self.acting_group(request, group_id, user_id, 1)?;
                self.request_join(target, group_id, MemberType::Group)
            }
            (Get, [group_id, "all", time, id]) => {
                self.acting_group(request, group_id, user_id, i32::MAX)?;
                self.groups_of(group_id, time, id)
            }
            (Get, [group_id, "invite", time, id]) => {
                self.acting_group(request, group_id, user_id, i32::MAX)?;
                self.invites_of(group_id, time, id)
            }
            (Patch, [group_id, target, "invite"]) => {
                self.acting_group(request, group_id, user_id, 1)?;
                self.accept_invite(target, group_id)
            }
            (Delete, [group_id, target, "invite"]) => {
                self.acting_group(request, group_id, user_id, 1)?;
                self.reject_invite(target, group_id)
            }
            (Get, [group_id, "joins", time, id]) => {
                self.acting_group(request, group_id, user_id, 1)?;
                self.sent_join_requests_of(group_id, time, id)
            }
            (Delete, [group_id, "joins", target]) => {
                self.acting_group(request, group_id, user_id, 1)?;
                self.withdraw_join_request(target, group_id)
            }
            _ => Err((
                SERVER_NO_ROUTE,
                format!("no group route for {} {}", request.method, rest.join("/")),
            )),
        }
    }

    // ==================== Directory ====================

    fn user_public_key(&self, user_id: &str) -> Reply {
        let user = self.user(user_id)?;
        let generation = user.generations.last().ok_or_else(|| not_found(user_id))?;
        reply(&UserPublicKeyData {
            public_key: DefaultCrypto::export_signed_public_key(
                &generation.id,
                &generation.public_key,
                &generation.public_key_sig,
            )
            .map_err(internal)?,
            public_key_id: generation.id.clone(),
            public_key_sig_key_id: Some(generation.id.clone()),
            verified: false,
        })
    }

    fn user_verify_key(&self, user_id: &str, key_id: &str) -> Reply {
        if let Some(code) = self.failing_verify_keys {
            return Err((code, "verify key lookup failed".to_string()));
        }
        let generation = self
            .user(user_id)?
            .generation(key_id)
            .ok_or_else(|| not_found(key_id))?;
        reply(&UserVerifyKeyData {
            verify_key: DefaultCrypto::export_verify_key(key_id, &generation.verify_key)
                .map_err(internal)?,
            verify_key_id: key_id.to_string(),
        })
    }

    fn group_public_key(&self, group_id: &str) -> Reply {
        if !self.groups.contains_key(group_id) {
            return Err(not_found(group_id));
        }
        let (public_key, public_key_id) = self.newest_public_key(group_id)?;
        reply(&GroupPublicKeyData {
            public_key,
            public_key_id,
        })
    }

    fn refresh(&mut self, request: &Request) -> Reply {
        let (user_id, device_id) = self.authenticate(request, true)?;
        let input: RefreshInput = body(request)?;
        if input.refresh_token != refresh_token(&device_id) {
            return Err((SERVER_INVALID_JWT, "wrong refresh token".to_string()));
        }
        self.refresh_calls += 1;
        reply(&RefreshOutput {
            jwt: issue_jwt(&user_id, &device_id, JWT_LIFETIME_SECS),
        })
    }

    // ==================== User Keys ====================

    fn user_key(&self, user_id: &str, device_id: &str, key_id: &str) -> Reply {
        let data = self
            .user(user_id)?
            .generation(key_id)
            .and_then(|g| g.key_data(device_id))
            .ok_or_else(|| no_copy(key_id))?;
        reply(&FetchedUserKey {
            key_data: serde_json::to_string(&data).map_err(internal)?,
        })
    }

    fn start_user_rotation(&mut self, request: &Request, user_id: &str, device_id: &str) -> Reply {
        let input: KeyRotationInput = body(request)?;
        let (Some(encrypted_sign_key), Some(verify_key), Some(public_key_sig)) = (
            input.encrypted_sign_key.clone(),
            input.verify_key.clone(),
            input.public_key_sig.clone(),
        ) else {
            return Err(bad("user rotation without sign key pair"));
        };
        if self
            .user(user_id)?
            .generation(&input.previous_group_key_id)
            .is_none()
        {
            return Err(bad("unknown previous user key"));
        }

        let key_id = self.next_id("uk");
        let time = self.tick();
        let user = self.user_mut(user_id)?;

        let mut records = Vec::new();
        for device in user.devices.iter().filter(|d| d.id != device_id) {
            let output = KeyRotationServerOutput {
                new_group_key_id: key_id.clone(),
                previous_group_key_id: input.previous_group_key_id.clone(),
                encrypted_eph_key_key_id: device.id.clone(),
                encrypted_ephemeral_key_by_group_key_and_public_key:
                    DefaultCrypto::wrap_ephemeral_key(
                        &device.keys.public_key,
                        &input.encrypted_ephemeral_key,
                    )
                    .map_err(internal)?,
                encrypted_group_key_by_ephemeral: input.encrypted_group_key_by_ephemeral.clone(),
                time,
            };
            records.push((
                device.id.clone(),
                RotationRecord {
                    pre_group_key_id: input.previous_group_key_id.clone(),
                    new_group_key_id: key_id.clone(),
                    encrypted_eph_key_key_id: device.id.clone(),
                    server_output: serde_json::to_string(&output).map_err(internal)?,
                },
            ));
        }

        let mut copies = HashMap::new();
        copies.insert(
            device_id.to_string(),
            (
                input.encrypted_group_key_by_user,
                input.invoker_public_key_id,
            ),
        );
        user.generations.push(UserGeneration {
            id: key_id.clone(),
            time,
            encrypted_private_key: input.encrypted_private_group_key,
            public_key: input.public_group_key,
            encrypted_sign_key,
            verify_key,
            public_key_sig,
            copies,
        });
        for (device, record) in records {
            user.rotations.entry(device).or_default().push(record);
        }

        reply(&KeyRotationStarted {
            group_id: user_id.to_string(),
            key_id,
        })
    }

    fn user_rotation_backlog(&self, user_id: &str, device_id: &str) -> Reply {
        let records = self
            .user(user_id)?
            .rotations
            .get(device_id)
            .cloned()
            .unwrap_or_default();
        reply(&self.backlog_order.apply(records))
    }

    fn done_user_rotation(
        &mut self,
        request: &Request,
        user_id: &str,
        device_id: &str,
        key_id: &str,
    ) -> Reply {
        let input: DoneKeyRotationInput = body(request)?;
        let user = self.user_mut(user_id)?;
        let generation = user
            .generations
            .iter_mut()
            .find(|g| g.id == key_id)
            .ok_or_else(|| bad("unknown user key"))?;
        generation.copies.insert(
            device_id.to_string(),
            (input.encrypted_new_group_key, input.public_key_id),
        );
        if let Some(records) = user.rotations.get_mut(device_id) {
            records.retain(|r| r.new_group_key_id != key_id);
        }
        done()
    }

    fn devices(&self, user_id: &str, time: &str, id: &str) -> Reply {
        let items = self
            .user(user_id)?
            .devices
            .iter()
            .map(|d| {
                (
                    d.time,
                    d.id.clone(),
                    UserDeviceListItem {
                        device_id: d.id.clone(),
                        time: d.time,
                        device_identifier: d.identifier.clone(),
                    },
                )
            })
            .collect();
        reply(&page_after(items, time, id))
    }

    fn done_register_device(&mut self, request: &Request, user_id: &str, new_device: &str) -> Reply {
        let input: NewMemberKeysInput = body(request)?;
        let session_id = (input.key_count > input.keys.len()).then(|| self.next_id("session"));
        let user = self.user_mut(user_id)?;
        let position = user
            .pending_devices
            .iter()
            .position(|d| d.id == new_device)
            .ok_or_else(|| not_found(new_device))?;
        let device = user.pending_devices.remove(position);
        user.devices.push(device);
        user.store_copies(new_device, &input);
        if let Some(id) = &session_id {
            user.device_sessions.insert(id.clone(), new_device.to_string());
        }
        reply(&KeySessionOutput { session_id })
    }

    fn device_upload_session(&mut self, request: &Request, user_id: &str, session_id: &str) -> Reply {
        if self.failing_uploads > 0 {
            self.failing_uploads -= 1;
            return Err((SERVER_UPLOAD_FAILED, "upload failed".to_string()));
        }
        let input: NewMemberKeysInput = body(request)?;
        let user = self.user_mut(user_id)?;
        let device_id = user
            .device_sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| bad("unknown upload session"))?;
        user.store_copies(&device_id, &input);
        done()
    }

    // ==================== Sym Keys ====================

    fn register_sym_key(&mut self, request: &Request) -> Reply {
        let input: RegisterSymKeyInput = body(request)?;
        let key_id = self.next_id("sym");
        let time = self.tick();
        self.sym_keys.insert(
            key_id.clone(),
            SymKeyServerData {
                key_id: key_id.clone(),
                master_key_id: input.master_key_id,
                encrypted_key: input.encrypted_key,
                time,
            },
        );
        reply(&SymKeyRegistered { key_id })
    }

    fn sym_key(&self, key_id: &str) -> Reply {
        reply(self.sym_keys.get(key_id).ok_or_else(|| not_found(key_id))?)
    }

    fn delete_sym_key(&mut self, key_id: &str) -> Reply {
        self.sym_keys
            .remove(key_id)
            .ok_or_else(|| not_found(key_id))?;
        done()
    }

    // ==================== Groups ====================

    fn create_group(&mut self, request: &Request, user_id: &str) -> Reply {
        let input: CreateGroupInput = body(request)?;
        let group_id = self.next_id("group");
        let generation_id = self.next_id("gk");
        let time = self.tick();

        let mut group = Group::new(
            group_id.clone(),
            None,
            time,
            generation_id,
            user_id,
            input,
        );
        group.members.insert(
            user_id.to_string(),
            Membership {
                kind: MemberType::User,
                rank: 0,
                time,
            },
        );
        self.groups.insert(group_id.clone(), group);
        reply(&GroupCreated { group_id })
    }

    fn create_related(
        &mut self,
        request: &Request,
        group_id: &str,
        user_id: &str,
        connected: bool,
    ) -> Reply {
        if self.acting_access(request, group_id, user_id)?.rank > 1 {
            return Err(no_rank());
        }
        let input: CreateGroupInput = body(request)?;
        let new_id = self.next_id("group");
        let generation_id = self.next_id("gk");
        let time = self.tick();

        let parent = (!connected).then(|| group_id.to_string());
        let mut group = Group::new(new_id.clone(), parent, time, generation_id, group_id, input);
        if connected {
            group.is_connected_group = true;
            group.members.insert(
                group_id.to_string(),
                Membership {
                    kind: MemberType::Group,
                    rank: 0,
                    time,
                },
            );
        }
        self.groups.insert(new_id.clone(), group);
        reply(&GroupCreated { group_id: new_id })
    }

    fn group_data(&self, request: &Request, group_id: &str, user_id: &str) -> Reply {
        let access = self.acting_access(request, group_id, user_id)?;
        let group = self.group(group_id)?;
        reply(&GroupServerData {
            group_id: group.id.clone(),
            parent_group_id: group.parent.clone(),
            rank: access.rank,
            key_update: group.has_rotations(&access.key_holder),
            created_time: group.created_time,
            joined_time: access.joined_time,
            keys: group.key_page(&access.key_holder, None)?,
            hmac_keys: group.hmac_keys.clone(),
            sortable_keys: group.sortable_keys.clone(),
            access_by_parent_group: access.inherited_from,
            access_by_group_as_member: request.group_as_member.clone(),
            is_connected_group: group.is_connected_group,
        })
    }

    fn update_check(&self, request: &Request, group_id: &str, user_id: &str) -> Reply {
        let access = self.acting_access(request, group_id, user_id)?;
        reply(&GroupUpdateCheck {
            key_update: self.group(group_id)?.has_rotations(&access.key_holder),
            rank: access.rank,
        })
    }

    fn key_page(&self, request: &Request, group_id: &str, user_id: &str, time: &str) -> Reply {
        let access = self.acting_access(request, group_id, user_id)?;
        let before = time.parse::<u64>().map_err(|_| bad("cursor time"))?;
        reply(&self.group(group_id)?.key_page(&access.key_holder, Some(before))?)
    }

    fn key_copy(&self, request: &Request, group_id: &str, user_id: &str, key_id: &str) -> Reply {
        let access = self.acting_access(request, group_id, user_id)?;
        reply(&self.group(group_id)?.key_copy(&access.key_holder, key_id)?)
    }

    fn children(
        &self,
        request: &Request,
        group_id: &str,
        user_id: &str,
        time: &str,
        id: &str,
    ) -> Reply {
        self.acting_access(request, group_id, user_id)?;
        let items = self
            .groups
            .values()
            .filter(|g| g.parent.as_deref() == Some(group_id))
            .map(|g| {
                (
                    g.created_time,
                    g.id.clone(),
                    GroupChildrenListItem {
                        group_id: g.id.clone(),
                        time: g.created_time,
                        parent: g.parent.clone(),
                    },
                )
            })
            .collect();
        reply(&page_after(items, time, id))
    }

    fn members(
        &self,
        request: &Request,
        group_id: &str,
        user_id: &str,
        time: &str,
        id: &str,
    ) -> Reply {
        self.acting_access(request, group_id, user_id)?;
        let items = self
            .group(group_id)?
            .members
            .iter()
            .map(|(member_id, m)| {
                (
                    m.time,
                    member_id.clone(),
                    GroupUserListItem {
                        user_id: member_id.clone(),
                        rank: m.rank,
                        joined_time: m.time,
                        user_type: m.kind,
                    },
                )
            })
            .collect();
        reply(&page_after(items, time, id))
    }

    fn delete_group(&mut self, request: &Request, group_id: &str, user_id: &str) -> Reply {
        if self.acting_access(request, group_id, user_id)?.rank > 1 {
            return Err(no_rank());
        }
        let mut doomed = vec![group_id.to_string()];
        let mut i = 0;
        while let Some(id) = doomed.get(i).cloned() {
            doomed.extend(
                self.groups
                    .values()
                    .filter(|g| g.parent.as_deref() == Some(id.as_str()))
                    .map(|g| g.id.clone()),
            );
            i += 1;
        }
        for id in doomed {
            self.groups.remove(&id);
        }
        done()
    }

    // ==================== Rotation ====================

    fn start_rotation(&mut self, request: &Request, group_id: &str, user_id: &str) -> Reply {
        let access = self.acting_access(request, group_id, user_id)?;
        let input: KeyRotationInput = body(request)?;
        let group = self.group(group_id)?;
        if group.generation(&input.previous_group_key_id).is_none() {
            return Err(bad("unknown previous group key"));
        }

        let mut recipients: Vec<String> = group.members.keys().cloned().collect();
        recipients.extend(group.parent.clone());
        recipients.retain(|r| *r != access.key_holder);

        let key_id = self.next_id("gk");
        let time = self.tick();

        let mut records = Vec::new();
        for recipient in recipients {
            let Ok((public_key, public_key_id)) = self.newest_public_key(&recipient) else {
                continue;
            };
            let output = KeyRotationServerOutput {
                new_group_key_id: key_id.clone(),
                previous_group_key_id: input.previous_group_key_id.clone(),
                encrypted_eph_key_key_id: public_key_id.clone(),
                encrypted_ephemeral_key_by_group_key_and_public_key:
                    DefaultCrypto::wrap_ephemeral_key(&public_key, &input.encrypted_ephemeral_key)
                        .map_err(internal)?,
                encrypted_group_key_by_ephemeral: input.encrypted_group_key_by_ephemeral.clone(),
                time,
            };
            records.push((
                recipient,
                RotationRecord {
                    pre_group_key_id: input.previous_group_key_id.clone(),
                    new_group_key_id: key_id.clone(),
                    encrypted_eph_key_key_id: public_key_id,
                    server_output: serde_json::to_string(&output).map_err(internal)?,
                },
            ));
        }

        let group = self.group_mut(group_id)?;
        group.generations.push(Generation {
            id: key_id.clone(),
            time,
            encrypted_private_group_key: input.encrypted_private_group_key,
            public_group_key: input.public_group_key,
            group_key_sig: input.group_key_sig,
            signed_by_user_id: input.signed_by_user_id,
            signed_by_user_sign_key_id: input.signed_by_user_sign_key_id,
        });
        group.copies.entry(access.key_holder).or_default().insert(
            key_id.clone(),
            KeyCopy {
                private_key_id: input.invoker_public_key_id,
                encrypted_group_key: input.encrypted_group_key_by_user,
            },
        );
        for (recipient, record) in records {
            group.rotations.entry(recipient).or_default().push(record);
        }

        reply(&KeyRotationStarted {
            group_id: group_id.to_string(),
            key_id,
        })
    }

    fn rotation_backlog(&self, request: &Request, group_id: &str, user_id: &str) -> Reply {
        let access = self.acting_access(request, group_id, user_id)?;
        let records = self
            .group(group_id)?
            .rotations
            .get(&access.key_holder)
            .cloned()
            .unwrap_or_default();
        reply(&self.backlog_order.apply(records))
    }

    fn done_rotation(
        &mut self,
        request: &Request,
        group_id: &str,
        user_id: &str,
        key_id: &str,
    ) -> Reply {
        let access = self.acting_access(request, group_id, user_id)?;
        let input: DoneKeyRotationInput = body(request)?;
        let group = self.group_mut(group_id)?;
        if group.generation(key_id).is_none() {
            return Err(bad("unknown group key"));
        }
        group
            .copies
            .entry(access.key_holder.clone())
            .or_default()
            .insert(
                key_id.to_string(),
                KeyCopy {
                    private_key_id: input.public_key_id,
                    encrypted_group_key: input.encrypted_new_group_key,
                },
            );
        if let Some(records) = group.rotations.get_mut(&access.key_holder) {
            records.retain(|r| r.new_group_key_id != key_id);
        }
        done()
    }

    // ==================== Membership ====================

    fn add_member(
        &mut self,
        request: &Request,
        group_id: &str,
        user_id: &str,
        route: &str,
        target: &str,
    ) -> Reply {
        if self.acting_access(request, group_id, user_id)?.rank > 2 {
            return Err(no_rank());
        }
        let kind = if route.contains("group") {
            MemberType::Group
        } else {
            MemberType::User
        };
        let known = match kind {
            MemberType::User => self.users.contains_key(target),
            MemberType::Group => self.groups.contains_key(target),
        };
        if !known {
            return Err(not_found(target));
        }

        let input: NewMemberKeysInput = body(request)?;
        let time = self.tick();
        let session_id = (input.key_count > input.keys.len()).then(|| self.next_id("session"));
        let group = self.group_mut(group_id)?;
        let membership = Membership {
            kind,
            rank: input.rank.unwrap_or(DEFAULT_MEMBER_RANK),
            time,
        };

        match route {
            "re_invite" | "re_invite_group" => {
                if !group.members.contains_key(target) {
                    return Err(bad("re-invite of a non member"));
                }
                group.copies.remove(target);
            }
            "invite_auto" | "invite_group_auto" => {
                if group.members.contains_key(target) {
                    return Err(bad("already a member"));
                }
                group.members.insert(target.to_string(), membership);
            }
            _ => {
                if !group.invites_open {
                    return Err((SERVER_INVITES_CLOSED, "invites are closed".to_string()));
                }
                if group.members.contains_key(target) {
                    return Err(bad("already a member"));
                }
                group.invites.insert(target.to_string(), membership);
            }
        }

        group.store_copies(target, &input);
        if let Some(id) = &session_id {
            group.sessions.insert(id.clone(), target.to_string());
        }
        reply(&KeySessionOutput { session_id })
    }

    fn upload_session(
        &mut self,
        request: &Request,
        group_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Reply {
        if self.acting_access(request, group_id, user_id)?.rank > 2 {
            return Err(no_rank());
        }
        if self.failing_uploads > 0 {
            self.failing_uploads -= 1;
            return Err((SERVER_UPLOAD_FAILED, "upload failed".to_string()));
        }
        let input: NewMemberKeysInput = body(request)?;
        let group = self.group_mut(group_id)?;
        let holder = group
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| bad("unknown upload session"))?;
        group.store_copies(&holder, &input);
        done()
    }

    fn accept_invite(&mut self, group_id: &str, principal: &str) -> Reply {
        let time = self.tick();
        let group = self.group_mut(group_id)?;
        let mut membership = group
            .invites
            .remove(principal)
            .ok_or_else(|| bad("no invite"))?;
        membership.time = time;
        group.members.insert(principal.to_string(), membership);
        done()
    }

    fn reject_invite(&mut self, group_id: &str, principal: &str) -> Reply {
        let group = self.group_mut(group_id)?;
        group
            .invites
            .remove(principal)
            .ok_or_else(|| bad("no invite"))?;
        group.copies.remove(principal);
        done()
    }

    fn request_join(&mut self, group_id: &str, principal: &str, kind: MemberType) -> Reply {
        let time = self.tick();
        let group = self.group_mut(group_id)?;
        if !group.invites_open {
            return Err((SERVER_INVITES_CLOSED, "join requests are closed".to_string()));
        }
        if group.members.contains_key(principal) {
            return Err(bad("already a member"));
        }
        group.join_requests.insert(
            principal.to_string(),
            Membership {
                kind,
                rank: DEFAULT_MEMBER_RANK,
                time,
            },
        );
        done()
    }

    fn withdraw_join_request(&mut self, group_id: &str, principal: &str) -> Reply {
        self.group_mut(group_id)?
            .join_requests
            .remove(principal)
            .ok_or_else(|| bad("no join request"))?;
        done()
    }

    fn join_requests(
        &self,
        request: &Request,
        group_id: &str,
        user_id: &str,
        time: &str,
        id: &str,
    ) -> Reply {
        if self.acting_access(request, group_id, user_id)?.rank > 2 {
            return Err(no_rank());
        }
        let items = self
            .group(group_id)?
            .join_requests
            .iter()
            .map(|(member_id, m)| {
                (
                    m.time,
                    member_id.clone(),
                    GroupJoinReqListItem {
                        user_id: member_id.clone(),
                        time: m.time,
                        user_type: m.kind,
                    },
                )
            })
            .collect();
        reply(&page_after(items, time, id))
    }

    fn accept_join_request(
        &mut self,
        request: &Request,
        group_id: &str,
        user_id: &str,
        member_id: &str,
    ) -> Reply {
        if self.acting_access(request, group_id, user_id)?.rank > 2 {
            return Err(no_rank());
        }
        let input: NewMemberKeysInput = body(request)?;
        let time = self.tick();
        let session_id = (input.key_count > input.keys.len()).then(|| self.next_id("session"));
        let group = self.group_mut(group_id)?;
        let pending = group
            .join_requests
            .remove(member_id)
            .ok_or_else(|| bad("no join request"))?;
        group.members.insert(
            member_id.to_string(),
            Membership {
                kind: pending.kind,
                rank: input.rank.unwrap_or(DEFAULT_MEMBER_RANK),
                time,
            },
        );
        group.store_copies(member_id, &input);
        if let Some(id) = &session_id {
            group.sessions.insert(id.clone(), member_id.to_string());
        }
        reply(&KeySessionOutput { session_id })
    }

    fn reject_join_request(
        &mut self,
        request: &Request,
        group_id: &str,
        user_id: &str,
        member_id: &str,
    ) -> Reply {
        if self.acting_access(request, group_id, user_id)?.rank > 2 {
            return Err(no_rank());
        }
        self.group_mut(group_id)?
            .join_requests
            .remove(member_id)
            .ok_or_else(|| bad("no join request"))?;
        done()
    }

    fn stop_invites(&mut self, request: &Request, group_id: &str, user_id: &str) -> Reply {
        if self.acting_access(request, group_id, user_id)?.rank > 1 {
            return Err(no_rank());
        }
        self.group_mut(group_id)?.invites_open = false;
        done()
    }

    fn change_rank(&mut self, request: &Request, group_id: &str, user_id: &str) -> Reply {
        if self.acting_access(request, group_id, user_id)?.rank > 1 {
            return Err(no_rank());
        }
        let input: ChangeRankInput = body(request)?;
        let member = self
            .group_mut(group_id)?
            .members
            .get_mut(&input.changed_user_id)
            .ok_or_else(|| not_found(&input.changed_user_id))?;
        member.rank = input.new_rank;
        done()
    }

    fn kick(&mut self, request: &Request, group_id: &str, user_id: &str, member_id: &str) -> Reply {
        let access = self.acting_access(request, group_id, user_id)?;
        if access.rank > 2 {
            return Err(no_rank());
        }
        let group = self.group_mut(group_id)?;
        let target = group
            .members
            .get(member_id)
            .ok_or_else(|| not_found(member_id))?;
        if target.rank < access.rank {
            return Err(no_rank());
        }
        group.remove_principal(member_id);
        done()
    }

    fn leave(&mut self, request: &Request, group_id: &str, user_id: &str) -> Reply {
        let principal = self.principal(request, user_id)?;
        let group = self.group_mut(group_id)?;
        if !group.members.contains_key(&principal) {
            return Err(no_access(group_id));
        }
        group.remove_principal(&principal);
        done()
    }

    fn acting_group(
        &self,
        request: &Request,
        group_id: &str,
        user_id: &str,
        max_rank: i32,
    ) -> Out<()> {
        if self.acting_access(request, group_id, user_id)?.rank > max_rank {
            return Err(no_rank());
        }
        Ok(())
    }

    fn groups_of(&self, principal: &str, time: &str, id: &str) -> Reply {
        let items = self
            .groups
            .values()
            .filter_map(|g| g.members.get(principal).map(|m| (g, m)))
            .map(|(g, m)| {
                (
                    m.time,
                    g.id.clone(),
                    GroupListItem {
                        group_id: g.id.clone(),
                        time: g.created_time,
                        joined_time: m.time,
                        rank: m.rank,
                        parent: g.parent.clone(),
                    },
                )
            })
            .collect();
        reply(&page_after(items, time, id))
    }

    fn invites_of(&self, principal: &str, time: &str, id: &str) -> Reply {
        let items = self
            .groups
            .values()
            .filter_map(|g| g.invites.get(principal).map(|m| (g, m)))
            .map(|(g, m)| {
                (
                    m.time,
                    g.id.clone(),
                    GroupInviteListItem {
                        group_id: g.id.clone(),
                        time: m.time,
                    },
                )
            })
            .collect();
        reply(&page_after(items, time, id))
    }

    fn sent_join_requests_of(&self, principal: &str, time: &str, id: &str) -> Reply {
        let items = self
            .groups
            .values()
            .filter_map(|g| g.join_requests.get(principal).map(|m| (g, m)))
            .map(|(g, m)| {
                (
                    m.time,
                    g.id.clone(),
                    GroupInviteListItem {
                        group_id: g.id.clone(),
                        time: m.time,
                    },
                )
            })
            .collect();
        reply(&page_after(items, time, id))
    }
}

// ==================== Server ====================

/// In-memory key server shared by every test client.
#[derive(Default)]
pub struct FakeKeyServer {
    state: Mutex<State>,
}

impl FakeKeyServer {
    /// Creates an empty server.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("server state lock")
    }

    /// Registers a user with one device and a first user key generation, and
    /// returns the login output of that device.
    pub fn register_user(&self, user_id: &str) -> LoginData {
        let mut state = self.state();
        let device_id = format!("{user_id}-device-1");
        let device = DefaultCrypto::generate_device_keys(&device_id).expect("device keys");
        let time = state.tick();
        let key_id = state.next_id("uk");

        let data = DefaultCrypto::create_user_key_data(&device.public_key, &key_id, time)
            .expect("user key data");
        let user_key = CRYPTO
            .decrypt_user_key(
                &device.private_key,
                &serde_json::to_string(&data).expect("user key data encodes"),
            )
            .expect("user key unwraps");
        let hmac: RegisterSymKeyInput = serde_json::from_str(
            &CRYPTO
                .prepare_register_sym_key(&user_key.group_key)
                .expect("hmac key"),
        )
        .expect("hmac key decodes");

        state.users.insert(
            user_id.to_string(),
            User {
                id: user_id.to_string(),
                devices: vec![Device {
                    id: device_id.clone(),
                    identifier: "device-1".to_string(),
                    time,
                    keys: device,
                }],
                pending_devices: Vec::new(),
                device_sessions: HashMap::new(),
                generations: vec![UserGeneration::from_key_data(data, &device_id)],
                rotations: HashMap::new(),
                hmac_key: Some(FetchedAuxKey {
                    group_key_id: key_id,
                    key_data: hmac.encrypted_key,
                }),
            },
        );
        state.login_data(user_id, &device_id, JWT_LIFETIME_SECS)
    }

    /// Registers another device of `user_id`. It receives every user key
    /// generation the first device holds.
    pub fn add_device(&self, user_id: &str) -> LoginData {
        let mut state = self.state();
        let time = state.tick();
        let user = state.users.get_mut(user_id).expect("user is registered");
        let device_id = format!("{user_id}-device-{}", user.devices.len() + 1);
        let keys = DefaultCrypto::generate_device_keys(&device_id).expect("device keys");
        let first = user.devices[0].keys.clone();
        let first_id = user.devices[0].id.clone();

        for generation in &mut user.generations {
            let Some(data) = generation.key_data(&first_id) else {
                continue;
            };
            let key = CRYPTO
                .decrypt_user_key(
                    &first.private_key,
                    &serde_json::to_string(&data).expect("user key data encodes"),
                )
                .expect("user key unwraps");
            let wrapped: NewMemberKeysInput = serde_json::from_str(
                &CRYPTO
                    .prepare_keys_for_new_member(&keys.public_key, &[key.group_key.as_str()], 1, None)
                    .expect("wrap user key"),
            )
            .expect("wrapped key decodes");
            generation.copies.insert(
                device_id.clone(),
                (wrapped.keys[0].encrypted_group_key.clone(), device_id.clone()),
            );
        }

        user.devices.push(Device {
            id: device_id.clone(),
            identifier: format!("device-{}", user.devices.len() + 1),
            time,
            keys,
        });
        state.login_data(user_id, &device_id, JWT_LIFETIME_SECS)
    }

    /// Signs in a new device of `user_id` that holds no user keys yet.
    /// Returns the registration output the new device hands to a device
    /// that is already registered.
    pub fn start_device_registration(&self, user_id: &str) -> String {
        let mut state = self.state();
        let time = state.tick();
        let user = state.users.get_mut(user_id).expect("user is registered");
        let number = user.devices.len() + user.pending_devices.len() + 1;
        let device_id = format!("{user_id}-device-{number}");
        let keys = DefaultCrypto::generate_device_keys(&device_id).expect("device keys");
        let output = DeviceRegistration {
            device_id: device_id.clone(),
            device_identifier: format!("device-{number}"),
            public_key: keys.public_key.clone(),
        };
        user.pending_devices.push(Device {
            id: device_id,
            identifier: output.device_identifier.clone(),
            time,
            keys,
        });
        serde_json::to_string(&output).expect("registration encodes")
    }

    /// Login output of a registered device.
    pub fn login(&self, user_id: &str, device_id: &str) -> LoginData {
        self.state().login_data(user_id, device_id, JWT_LIFETIME_SECS)
    }

    /// Login output whose JWT expired a minute ago.
    pub fn expired_login(&self, user_id: &str, device_id: &str) -> LoginData {
        self.state().login_data(user_id, device_id, -60)
    }

    /// A JWT the server accepts for a device, as an external auth service
    /// would hand out.
    pub fn issue_jwt(&self, user_id: &str, device_id: &str) -> String {
        issue_jwt(user_id, device_id, JWT_LIFETIME_SECS)
    }

    /// Removes a user; lookups of its keys answer `server_100` afterwards.
    pub fn delete_user(&self, user_id: &str) {
        self.state().users.remove(user_id);
    }

    /// Order of the rotation backlogs handed out from now on.
    pub fn set_backlog_order(&self, order: BacklogOrder) {
        self.state().backlog_order = order;
    }

    /// Makes the next `count` session uploads fail.
    pub fn fail_next_session_uploads(&self, count: usize) {
        self.state().failing_uploads = count;
    }

    /// Forgets every key copy `holder` has in a group while keeping its
    /// membership.
    pub fn drop_key_copies(&self, group_id: &str, holder: &str) {
        if let Some(group) = self.state().groups.get_mut(group_id) {
            group.copies.remove(holder);
        }
    }

    /// Makes every verify key lookup fail with `code` until cleared.
    pub fn fail_verify_key_lookups(&self, code: Option<u32>) {
        self.state().failing_verify_keys = code;
    }

    /// Claims every generation of a group was signed by `user_id`'s newest
    /// user key, which did not sign any of them.
    pub fn forge_group_signer(&self, group_id: &str, user_id: &str) {
        let mut state = self.state();
        let key_id = state.users[user_id]
            .generations
            .last()
            .map(|g| g.id.clone())
            .expect("user has a key");
        let group = state.groups.get_mut(group_id).expect("group exists");
        for generation in &mut group.generations {
            generation.signed_by_user_id = Some(user_id.to_string());
            generation.signed_by_user_sign_key_id = Some(key_id.clone());
        }
    }

    /// Number of JWT refreshes served.
    pub fn refresh_calls(&self) -> usize {
        self.state().refresh_calls
    }

    /// Number of requests with `method` whose path contains `needle`.
    pub fn requests_matching(&self, method: HttpMethod, needle: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|(m, path)| *m == method && path.contains(needle))
            .count()
    }

    /// Pending rotation records of a key holder in a group.
    pub fn pending_rotations(&self, group_id: &str, key_holder: &str) -> usize {
        self.state()
            .groups
            .get(group_id)
            .and_then(|g| g.rotations.get(key_holder))
            .map_or(0, Vec::len)
    }

    /// Principals holding key copies of a group.
    pub fn key_holders(&self, group_id: &str) -> Vec<String> {
        let state = self.state();
        let mut holders: Vec<String> = state
            .groups
            .get(group_id)
            .map(|g| g.copies.keys().cloned().collect())
            .unwrap_or_default();
        holders.sort();
        holders
    }

    /// Key copies of a group held by `key_holder`.
    pub fn copy_count(&self, group_id: &str, key_holder: &str) -> usize {
        self.state()
            .groups
            .get(group_id)
            .and_then(|g| g.copies.get(key_holder))
            .map_or(0, HashMap::len)
    }

    /// Number of key generations of a group.
    pub fn generation_count(&self, group_id: &str) -> usize {
        self.state()
            .groups
            .get(group_id)
            .map_or(0, |g| g.generations.len())
    }
}

#[async_trait]
impl Transport for FakeKeyServer {
    async fn make_req(&self, request: Request) -> keyweave_core::Result<String> {
        let mut state = self.state();
        let path = request
            .url
            .strip_prefix(BASE_URL)
            .unwrap_or(&request.url)
            .to_string();
        state.requests.push((request.method, path));

        let output = match state.handle(&request) {
            Ok(result) => ServerOutput::ok(result),
            Err((code, message)) => ServerOutput::err(code, message),
        };
        serde_json::to_string(&output).map_err(SdkError::from)
    }
}

// ==================== Sessions ====================

/// Client configuration pointing at the fake server.
pub fn config() -> SdkConfig {
    SdkConfig::new(BASE_URL, APP_TOKEN)
}

/// Configuration that refreshes rank and key update state on every open.
pub fn eager_config() -> SdkConfig {
    config().with_group_check_ttl(Duration::ZERO)
}

/// A client with its own in-memory store.
pub fn client(server: &Arc<FakeKeyServer>, config: SdkConfig) -> Client {
    Client::with_defaults(config, server.clone())
}

/// Registers `user_id` and restores its session on a fresh client.
pub async fn new_user(server: &Arc<FakeKeyServer>, user_id: &str) -> UserSession {
    new_user_with(server, user_id, config()).await
}

/// Like [`new_user`], with an explicit configuration.
pub async fn new_user_with(
    server: &Arc<FakeKeyServer>,
    user_id: &str,
    config: SdkConfig,
) -> UserSession {
    let login = server.register_user(user_id);
    client(server, config)
        .restore_user(&format!("{user_id}-laptop"), login)
        .await
        .expect("restore user")
}

/// Creates a group owned by `owner` and adds `members` without invites.
pub async fn shared_group(owner: &mut UserSession, members: &[&str]) -> String {
    let group_id = owner.create_group(false).await.expect("create group");
    let group = owner.get_group(&group_id, None).await.expect("open group");
    for member in members {
        group
            .invite_auto(owner, member, None)
            .await
            .expect("add member");
    }
    group_id
}
