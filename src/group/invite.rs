//! Key copies for new members and new devices.
//!
//! A new member receives a copy of every key generation. The first page of
//! copies travels with the invite or the accepted join request; when the
//! server answers with a session id, the remaining pages are uploaded
//! concurrently and failures are collected per page. Registering a new
//! device hands it the user key generations the same way.

use futures::future::join_all;
use log::{debug, warn};

use crate::config::KEY_PAGE_SIZE;
use crate::context::Context;
use crate::directory;
use crate::error::{Result, SdkError};
use crate::keygraph::{GroupKey, KeyRing, VersionedKey};
use crate::net::types::MemberType;
use crate::net::HttpMethod;
use crate::user::UserKey;

/// A key generation whose symmetric key is copied to new holders.
pub(crate) trait SharedGeneration: VersionedKey {
    /// Exported symmetric key.
    fn symmetric_key(&self) -> &str;
}

impl SharedGeneration for GroupKey {
    fn symmetric_key(&self) -> &str {
        &self.group_key
    }
}

impl SharedGeneration for UserKey {
    fn symmetric_key(&self) -> &str {
        &self.group_key
    }
}

/// Outcome of distributing key copies to a new member.
#[derive(Debug, Default)]
pub struct KeyUploadReport {
    /// Upload session the server opened, if more than one page was needed.
    pub session_id: Option<String>,
    /// Pages uploaded, including the page sent with the invite.
    pub uploaded_pages: usize,
    /// Pages whose session upload failed, with their errors.
    pub failed_pages: Vec<(usize, SdkError)>,
}

impl KeyUploadReport {
    /// Returns true if every page reached the server.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_pages.is_empty()
    }
}

/// Newest public key of a user or group about to become a member.
pub(crate) async fn member_public_key(
    ctx: &Context,
    kind: MemberType,
    member_id: &str,
) -> Result<String> {
    match kind {
        MemberType::User => Ok(directory::user_public_key(ctx, member_id)
            .await?
            .public_key),
        MemberType::Group => Ok(directory::group_public_key(ctx, member_id)
            .await?
            .public_key),
    }
}

/// Body carrying page `page` of `keys` for `public_key`, and whether more
/// pages follow.
pub(crate) fn key_page_body<K: SharedGeneration>(
    ctx: &Context,
    keys: &KeyRing<K>,
    public_key: &str,
    page: usize,
    rank: Option<i32>,
) -> Result<(String, bool)> {
    let (slice, more) = keys.page(page, KEY_PAGE_SIZE);
    let slice: Vec<&str> = slice.iter().map(SharedGeneration::symmetric_key).collect();
    let body = ctx
        .crypto
        .prepare_keys_for_new_member(public_key, &slice, keys.len(), rank)?;
    Ok((body, more))
}

/// Where the remaining key pages go.
pub(crate) struct PageUpload<'a> {
    /// Session route the server opened.
    pub session_path: &'a str,
    /// Group or user the keys belong to, for logs.
    pub owner: &'a str,
    /// Group the caller acts through, if any.
    pub group_as_member: Option<&'a str>,
}

/// Uploads every page after the first to the session concurrently.
pub(crate) async fn upload_remaining_pages<K: SharedGeneration>(
    ctx: &Context,
    jwt: &str,
    keys: &KeyRing<K>,
    target: &PageUpload<'_>,
    public_key: &str,
) -> Result<(usize, Vec<(usize, SdkError)>)> {
    let mut bodies = Vec::new();
    let mut page = 1;
    loop {
        let (body, more) = key_page_body(ctx, keys, public_key, page, None)?;
        bodies.push((page, body));
        if !more {
            break;
        }
        page += 1;
    }
    debug!(
        "uploading {} key pages of {} to {}",
        bodies.len(),
        target.owner,
        target.session_path
    );

    let uploads = bodies.into_iter().map(|(page, body)| {
        let request = ctx
            .request(HttpMethod::Put, target.session_path)
            .with_body(body)
            .with_jwt(jwt)
            .with_group_as_member(target.group_as_member);
        async move { (page, ctx.call_general(request).await) }
    });

    let mut uploaded = 0;
    let mut failed = Vec::new();
    for (page, outcome) in join_all(uploads).await {
        match outcome {
            Ok(()) => uploaded += 1,
            Err(e) => {
                warn!("key page {page} of {} failed: {e}", target.owner);
                failed.push((page, e));
            }
        }
    }
    Ok((uploaded, failed))
}
