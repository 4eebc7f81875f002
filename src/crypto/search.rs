//! Searchable and sortable encodings.
//!
//! Search tokens are hex HMAC-SHA256 values of the plaintext (or of each
//! prefix). Sortable values come from a keyed order preserving map of the
//! `u32` domain into `u64`: the domain is split in halves recursively and
//! every split point in the range is drawn from an HMAC of the node, so the
//! same key always yields the same strictly increasing map.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::{CryptoError, CryptoResult};

type HmacSha256 = Hmac<Sha256>;

/// Longest value (in chars) search tokens are created for.
pub const MAX_SEARCHABLE_CHARS: usize = 200;

fn mac(key: &[u8], parts: &[&[u8]]) -> CryptoResult<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(format!("hmac key: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Returns the search token of `data`.
///
/// # Errors
///
/// Returns an error if `data` is empty.
pub fn search_token(key: &[u8], data: &str) -> CryptoResult<String> {
    if data.is_empty() {
        return Err(CryptoError::InvalidInput("no content to search".to_string()));
    }
    Ok(hex::encode(mac(key, &[data.as_bytes()])?))
}

/// Returns the tokens stored next to an item so it can be found.
///
/// With `full` only the complete value is searchable, otherwise every prefix
/// (the first `limit` of them when a limit is set).
///
/// # Errors
///
/// Returns an error if `data` is empty or longer than
/// [`MAX_SEARCHABLE_CHARS`].
pub fn searchable_tokens(
    key: &[u8],
    data: &str,
    full: bool,
    limit: Option<usize>,
) -> CryptoResult<Vec<String>> {
    let chars = data.chars().count();
    if chars == 0 {
        return Err(CryptoError::InvalidInput("no content to search".to_string()));
    }
    if chars > MAX_SEARCHABLE_CHARS {
        return Err(CryptoError::InvalidInput(format!(
            "searchable content exceeds {MAX_SEARCHABLE_CHARS} chars"
        )));
    }

    if full {
        return Ok(vec![search_token(key, data)?]);
    }

    let take = limit.unwrap_or(chars).min(chars);
    data.char_indices()
        .map(|(i, c)| &data[..i + c.len_utf8()])
        .take(take)
        .map(|prefix| search_token(key, prefix))
        .collect()
}

fn node_draw(key: &[u8], dlo: u64, dhi: u64) -> CryptoResult<u64> {
    let (lo, hi) = (dlo.to_be_bytes(), dhi.to_be_bytes());
    let out = mac(key, &[b"ope".as_slice(), lo.as_slice(), hi.as_slice()])?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&out[..8]);
    Ok(u64::from_be_bytes(bytes))
}

fn pick(draw: u64, lo: u64, hi: u64) -> u64 {
    let span = hi - lo;
    if span == u64::MAX {
        draw
    } else {
        lo + draw % (span + 1)
    }
}

/// Order preserving encoding of `value`.
///
/// For a fixed key, `a < b` implies `encode(a) < encode(b)`.
///
/// # Errors
///
/// Returns an error if the key cannot be used as an HMAC key.
pub fn sortable_encode(key: &[u8], value: u32) -> CryptoResult<u64> {
    let value = u64::from(value);
    let (mut dlo, mut dhi) = (0u64, u64::from(u32::MAX));
    let (mut rlo, mut rhi) = (0u64, u64::MAX);

    while dlo < dhi {
        let dmid = dlo + (dhi - dlo) / 2;
        let left = dmid - dlo + 1;
        let right = dhi - dmid;

        // Both halves keep at least one range slot per domain value.
        let rmid = pick(node_draw(key, dlo, dhi)?, rlo + left - 1, rhi - right);

        if value <= dmid {
            dhi = dmid;
            rhi = rmid;
        } else {
            dlo = dmid + 1;
            rlo = rmid + 1;
        }
    }

    Ok(pick(node_draw(key, dlo, dhi)?, rlo, rhi))
}

/// Maps the first four bytes of `data` (zero padded) into the `u32` domain.
#[must_use]
pub fn string_prefix_value(data: &str) -> u32 {
    let mut bytes = [0u8; 4];
    for (slot, b) in bytes.iter_mut().zip(data.as_bytes()) {
        *slot = *b;
    }
    u32::from_be_bytes(bytes)
}
