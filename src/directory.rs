//! Cached lookups of other principals' public keys.
//!
//! Public and verify keys are cached in the key store on first fetch. The
//! group public key cache is also refreshed whenever a newer group key
//! generation is learned.

use crate::context::Context;
use crate::error::Result;
use crate::net::types::{GroupPublicKeyData, UserPublicKeyData, UserVerifyKeyData};
use crate::net::HttpMethod;
use crate::store::StorageKey;

/// Newest public key of a user.
///
/// # Errors
///
/// Returns transport, server or store errors.
pub async fn user_public_key(ctx: &Context, user_id: &str) -> Result<UserPublicKeyData> {
    let store_key = StorageKey::user_public_key(user_id);
    if let Some(cached) = ctx.load(&store_key).await? {
        return Ok(cached);
    }

    let mut fetched: UserPublicKeyData = ctx
        .call(ctx.request(HttpMethod::Get, &format!("api/v1/user/{user_id}/public_key")))
        .await?;
    fetched.verified = false;
    ctx.save(&store_key, &fetched).await?;
    Ok(fetched)
}

/// Verify key of one user key generation.
///
/// # Errors
///
/// Returns transport, server or store errors. A user that no longer exists
/// surfaces as `server_100`.
pub async fn user_verify_key(ctx: &Context, user_id: &str, key_id: &str) -> Result<String> {
    let store_key = StorageKey::user_verify_key(user_id, key_id);
    if let Some(cached) = ctx.load(&store_key).await? {
        return Ok(cached);
    }

    let fetched: UserVerifyKeyData = ctx
        .call(ctx.request(
            HttpMethod::Get,
            &format!("api/v1/user/{user_id}/verify_key/{key_id}"),
        ))
        .await?;
    ctx.save(&store_key, &fetched.verify_key).await?;
    Ok(fetched.verify_key)
}

/// Newest public key of a group.
///
/// # Errors
///
/// Returns transport, server or store errors.
pub async fn group_public_key(ctx: &Context, group_id: &str) -> Result<GroupPublicKeyData> {
    let store_key = StorageKey::group_public_key(group_id);
    if let Some(cached) = ctx.load(&store_key).await? {
        return Ok(cached);
    }

    let fetched: GroupPublicKeyData = ctx
        .call(ctx.request(HttpMethod::Get, &format!("api/v1/group/{group_id}/public_key")))
        .await?;
    ctx.save(&store_key, &fetched).await?;
    Ok(fetched)
}

/// Checks that a user's public key was signed by one of the user's sign
/// keys. A positive result is remembered in the cache.
///
/// # Errors
///
/// Returns an error if the verify key cannot be fetched or parsed.
pub async fn verify_user_public_key(
    ctx: &Context,
    user_id: &str,
    public_key: &UserPublicKeyData,
    force: bool,
) -> Result<bool> {
    if public_key.verified && !force {
        return Ok(true);
    }
    let Some(sig_key_id) = public_key.public_key_sig_key_id.as_deref() else {
        return Ok(false);
    };

    let verify_key = user_verify_key(ctx, user_id, sig_key_id).await?;
    let verified = ctx
        .crypto
        .verify_user_public_key(&verify_key, &public_key.public_key)?;

    if verified {
        let store_key = StorageKey::user_public_key(user_id);
        let mut cached: UserPublicKeyData = ctx
            .load(&store_key)
            .await?
            .unwrap_or_else(|| public_key.clone());
        if cached.public_key_id == public_key.public_key_id {
            cached.verified = true;
            ctx.save(&store_key, &cached).await?;
        }
    }
    Ok(verified)
}
