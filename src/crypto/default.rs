//! Default primitive provider.
//!
//! - Symmetric: XChaCha20-Poly1305, random 24 byte nonce prepended
//! - Asymmetric: X25519 ECIES (ephemeral key, HKDF-SHA256, XChaCha20-Poly1305)
//! - Signatures: Ed25519 over the ciphertext
//! - Search and sort: HMAC-SHA256 (see [`search`](super::search))
//!
//! Payload ciphertexts are framed as `[u16 head length][head json][body]`
//! where the body is `[signature]ciphertext`.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::error::{CryptoError, CryptoResult};
use super::search;
use super::wire::{
    CreateGroupInput, DoneKeyRotationInput, ExportedKey, GroupKeyData, KeyRotationInput,
    KeyRotationServerOutput, NewMemberKey, NewMemberKeysInput, NonRegisteredKey,
    RegisterSymKeyInput, UserKeyData,
};
use super::{CryptoProvider, EncryptedHead, JwtClaims, SignHead};
use crate::keygraph::GroupKey;
use crate::net::types::SymKeyServerData;
use crate::user::UserKey;

const ALG_SYM: &str = "xchacha20";
const ALG_ASYM: &str = "x25519";
const ALG_SIGN: &str = "ed25519";
const ALG_AUX: &str = "hmac-sha256";

const NONCE_LEN: usize = 24;
const SIG_LEN: usize = 64;
const ECIES_INFO: &[u8] = b"keyweave ecies v1";

type Secret = Zeroizing<[u8; 32]>;

/// Provider built on X25519, XChaCha20-Poly1305, Ed25519 and HMAC-SHA256.
///
/// # Example
///
/// ```
/// use keyweave_core::crypto::{CryptoProvider, DefaultCrypto};
///
/// let crypto = DefaultCrypto::new();
/// let (key, _wrapped) = crypto
///     .generate_non_registered_key(&DefaultCrypto::generate_sym_key("master").unwrap())
///     .unwrap();
/// let sealed = crypto.encrypt_string_symmetric(&key, "hello", None).unwrap();
/// assert_eq!(crypto.decrypt_string_symmetric(&key, &sealed, None).unwrap(), "hello");
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCrypto;

impl DefaultCrypto {
    /// Creates the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Generates an exported symmetric key with the given id.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be serialized.
    pub fn generate_sym_key(key_id: &str) -> CryptoResult<String> {
        export(key_id, ALG_SYM, &random_secret()[..])
    }
}

// ==================== Primitives ====================

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn random_secret() -> Secret {
    Zeroizing::new(random_bytes::<32>())
}

fn random_id() -> String {
    hex::encode(random_bytes::<16>())
}

fn to_secret(bytes: &[u8]) -> CryptoResult<Secret> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("expected 32 key bytes, got {}", bytes.len()))
    })?;
    Ok(Zeroizing::new(arr))
}

fn export(key_id: &str, alg: &str, bytes: &[u8]) -> CryptoResult<String> {
    exported(key_id, alg, STANDARD.encode(bytes), None)
}

fn exported(key_id: &str, alg: &str, key: String, sig: Option<String>) -> CryptoResult<String> {
    Ok(serde_json::to_string(&ExportedKey {
        key_id: key_id.to_string(),
        alg: alg.to_string(),
        key,
        sig,
    })?)
}

fn import(key: &str, alg: &str) -> CryptoResult<(ExportedKey, Secret)> {
    let parsed: ExportedKey =
        serde_json::from_str(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    if parsed.alg != alg {
        return Err(CryptoError::InvalidKey(format!(
            "expected {alg} key, got {}",
            parsed.alg
        )));
    }
    let bytes = Zeroizing::new(STANDARD.decode(&parsed.key)?);
    let secret = to_secret(&bytes)?;
    Ok((parsed, secret))
}

fn seal(key: &[u8; 32], plain: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let nonce = random_bytes::<NONCE_LEN>();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plain)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], data: &[u8]) -> CryptoResult<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::Decryption("ciphertext too short".to_string()));
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|e| CryptoError::Decryption(e.to_string()))
}

fn ecies_key(shared: &[u8; 32], eph_public: &[u8; 32], recipient: &[u8; 32]) -> CryptoResult<Secret> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut info = Vec::with_capacity(ECIES_INFO.len() + 64);
    info.extend_from_slice(ECIES_INFO);
    info.extend_from_slice(eph_public);
    info.extend_from_slice(recipient);

    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(&info, &mut *okm)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    Ok(okm)
}

fn seal_for(recipient: &PublicKey, plain: &[u8]) -> CryptoResult<Vec<u8>> {
    let eph = StaticSecret::from(random_bytes::<32>());
    let eph_public = PublicKey::from(&eph);
    let shared = eph.diffie_hellman(recipient);
    let key = ecies_key(shared.as_bytes(), eph_public.as_bytes(), recipient.as_bytes())?;

    let sealed = seal(&key, plain)?;
    let mut out = Vec::with_capacity(32 + sealed.len());
    out.extend_from_slice(eph_public.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open_with(secret: &StaticSecret, data: &[u8]) -> CryptoResult<Vec<u8>> {
    if data.len() < 32 + NONCE_LEN {
        return Err(CryptoError::Decryption("ciphertext too short".to_string()));
    }
    let (eph, sealed) = data.split_at(32);
    let eph: [u8; 32] = eph
        .try_into()
        .map_err(|_| CryptoError::Decryption("invalid ephemeral key".to_string()))?;
    let eph_public = PublicKey::from(eph);
    let own_public = PublicKey::from(secret);
    let shared = secret.diffie_hellman(&eph_public);
    let key = ecies_key(shared.as_bytes(), eph_public.as_bytes(), own_public.as_bytes())?;
    open(&key, sealed)
}

fn public_key(key: &str) -> CryptoResult<(ExportedKey, PublicKey)> {
    let (exported, bytes) = import(key, ALG_ASYM)?;
    Ok((exported, PublicKey::from(*bytes)))
}

fn private_key(key: &str) -> CryptoResult<(ExportedKey, StaticSecret)> {
    let (exported, bytes) = import(key, ALG_ASYM)?;
    Ok((exported, StaticSecret::from(*bytes)))
}

fn signing_key(key: &str) -> CryptoResult<(String, SigningKey)> {
    let (exported, bytes) = import(key, ALG_SIGN)?;
    Ok((exported.key_id, SigningKey::from_bytes(&bytes)))
}

fn verifying_key(key: &str) -> CryptoResult<VerifyingKey> {
    let (_, bytes) = import(key, ALG_SIGN)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn verify_signature(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
    let signature =
        Signature::from_slice(signature).map_err(|e| CryptoError::Verification(e.to_string()))?;
    key.verify(message, &signature)
        .map_err(|e| CryptoError::Verification(e.to_string()))
}

// ==================== Framing ====================

fn frame(head: &EncryptedHead, body: &[u8]) -> CryptoResult<Vec<u8>> {
    let head = serde_json::to_vec(head)?;
    let len = u16::try_from(head.len())
        .map_err(|_| CryptoError::Encoding("ciphertext head too long".to_string()))?;

    let mut out = Vec::with_capacity(2 + head.len() + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&head);
    out.extend_from_slice(body);
    Ok(out)
}

fn unframe(data: &[u8]) -> CryptoResult<(EncryptedHead, &[u8])> {
    if data.len() < 2 {
        return Err(CryptoError::Encoding("ciphertext has no head".to_string()));
    }
    let len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    let rest = &data[2..];
    if rest.len() < len {
        return Err(CryptoError::Encoding("ciphertext head truncated".to_string()));
    }
    let head: EncryptedHead = serde_json::from_slice(&rest[..len])
        .map_err(|e| CryptoError::Encoding(format!("ciphertext head: {e}")))?;
    Ok((head, &rest[len..]))
}

fn sign_body(sign_key: Option<&str>, ciphertext: Vec<u8>) -> CryptoResult<(Option<SignHead>, Vec<u8>)> {
    let Some(sign_key) = sign_key else {
        return Ok((None, ciphertext));
    };
    let (id, key) = signing_key(sign_key)?;
    let signature = key.sign(&ciphertext);

    let mut body = Vec::with_capacity(SIG_LEN + ciphertext.len());
    body.extend_from_slice(&signature.to_bytes());
    body.extend_from_slice(&ciphertext);
    Ok((
        Some(SignHead {
            id,
            alg: ALG_SIGN.to_string(),
        }),
        body,
    ))
}

fn check_body<'a>(
    head: &EncryptedHead,
    body: &'a [u8],
    verify_key: Option<&str>,
) -> CryptoResult<&'a [u8]> {
    if head.sign.is_none() {
        if verify_key.is_some() {
            return Err(CryptoError::Verification("payload is not signed".to_string()));
        }
        return Ok(body);
    }

    if body.len() < SIG_LEN {
        return Err(CryptoError::Encoding("signature truncated".to_string()));
    }
    let (signature, ciphertext) = body.split_at(SIG_LEN);
    if let Some(verify_key) = verify_key {
        verify_signature(&verifying_key(verify_key)?, ciphertext, signature)?;
    }
    Ok(ciphertext)
}

fn check_head_id(head: &EncryptedHead, key: &ExportedKey) -> CryptoResult<()> {
    if head.id == key.key_id {
        Ok(())
    } else {
        Err(CryptoError::Decryption(format!(
            "payload is encrypted with key {}, not {}",
            head.id, key.key_id
        )))
    }
}

// ==================== Key Generations ====================

struct Generation {
    key: Secret,
    public: [u8; 32],
    encrypted_private_group_key: String,
    public_group_key: String,
}

fn new_generation() -> CryptoResult<Generation> {
    let key = random_secret();
    let secret = random_secret();
    let public = PublicKey::from(&StaticSecret::from(*secret));
    Ok(Generation {
        encrypted_private_group_key: STANDARD.encode(seal(&key, &secret[..])?),
        public_group_key: STANDARD.encode(public.as_bytes()),
        public: public.to_bytes(),
        key,
    })
}

fn generation_message(encrypted_private_group_key: &str, public_group_key: &str) -> Vec<u8> {
    format!("{encrypted_private_group_key}.{public_group_key}").into_bytes()
}

type GenerationSignature = (Option<String>, Option<String>, Option<String>);

fn sign_generation(
    sign_key: Option<&str>,
    starter: &str,
    generation: &Generation,
) -> CryptoResult<GenerationSignature> {
    let Some(sign_key) = sign_key else {
        return Ok((None, None, None));
    };
    let (key_id, key) = signing_key(sign_key)?;
    let message = generation_message(
        &generation.encrypted_private_group_key,
        &generation.public_group_key,
    );
    let signature = STANDARD.encode(key.sign(&message).to_bytes());
    Ok((Some(starter.to_string()), Some(key_id), Some(signature)))
}

fn rotation_input(
    pre_key: &str,
    invoker_public_key: &str,
    sign_key: Option<&str>,
    starter: &str,
) -> CryptoResult<(KeyRotationInput, Generation)> {
    let (pre, pre_raw) = import(pre_key, ALG_SYM)?;
    let (invoker, invoker_key) = public_key(invoker_public_key)?;
    let generation = new_generation()?;
    let ephemeral = random_secret();
    let (signed_by_user_id, signed_by_user_sign_key_id, group_key_sig) =
        sign_generation(sign_key, starter, &generation)?;

    let input = KeyRotationInput {
        previous_group_key_id: pre.key_id,
        invoker_public_key_id: invoker.key_id,
        encrypted_group_key_by_user: STANDARD.encode(seal_for(&invoker_key, &generation.key[..])?),
        encrypted_ephemeral_key: STANDARD.encode(seal(&pre_raw, &ephemeral[..])?),
        encrypted_group_key_by_ephemeral: STANDARD.encode(seal(&ephemeral, &generation.key[..])?),
        encrypted_private_group_key: generation.encrypted_private_group_key.clone(),
        public_group_key: generation.public_group_key.clone(),
        signed_by_user_id,
        signed_by_user_sign_key_id,
        group_key_sig,
        encrypted_sign_key: None,
        verify_key: None,
        public_key_sig: None,
    };
    Ok((input, generation))
}

fn user_sign_pair(generation: &Generation) -> CryptoResult<(String, String, String)> {
    let sign_secret = random_secret();
    let sign_key = SigningKey::from_bytes(&sign_secret);
    let encrypted_sign_key = STANDARD.encode(seal(&generation.key, &sign_secret[..])?);
    let verify_key = STANDARD.encode(sign_key.verifying_key().as_bytes());
    let public_key_sig = STANDARD.encode(sign_key.sign(&generation.public).to_bytes());
    Ok((encrypted_sign_key, verify_key, public_key_sig))
}

// ==================== Provider ====================

impl CryptoProvider for DefaultCrypto {
    fn decrypt_group_key(
        &self,
        private_key: &str,
        key_data: &str,
        verify_key: Option<&str>,
    ) -> CryptoResult<GroupKey> {
        let data: GroupKeyData = serde_json::from_str(key_data)?;

        if let Some(verify_key) = verify_key {
            let signature = data.group_key_sig.as_deref().ok_or_else(|| {
                CryptoError::Verification(format!(
                    "key generation {} is not signed",
                    data.group_key_id
                ))
            })?;
            verify_signature(
                &verifying_key(verify_key)?,
                &generation_message(&data.encrypted_private_group_key, &data.public_group_key),
                &STANDARD.decode(signature)?,
            )?;
        }

        let (_, secret) = self::private_key(private_key)?;
        let group_key = to_secret(&Zeroizing::new(open_with(
            &secret,
            &STANDARD.decode(&data.encrypted_group_key)?,
        )?))?;
        let private_group_key = Zeroizing::new(open(
            &group_key,
            &STANDARD.decode(&data.encrypted_private_group_key)?,
        )?);
        let public_group_key = exported(
            &data.group_key_id,
            ALG_ASYM,
            data.public_group_key.clone(),
            None,
        )?;

        Ok(GroupKey {
            group_key: export(&data.group_key_id, ALG_SYM, &group_key[..])?,
            private_group_key: export(&data.group_key_id, ALG_ASYM, &private_group_key)?,
            exported_public_key: public_group_key.clone(),
            public_group_key,
            group_key_id: data.group_key_id.clone(),
            time: data.time,
        })
    }

    fn decrypt_user_key(&self, device_private_key: &str, key_data: &str) -> CryptoResult<UserKey> {
        let data: UserKeyData = serde_json::from_str(key_data)?;
        let (_, device) = private_key(device_private_key)?;

        let user_key = to_secret(&Zeroizing::new(open_with(
            &device,
            &STANDARD.decode(&data.encrypted_group_key)?,
        )?))?;
        let private = Zeroizing::new(open(&user_key, &STANDARD.decode(&data.encrypted_private_key)?)?);
        let sign = Zeroizing::new(open(&user_key, &STANDARD.decode(&data.encrypted_sign_key)?)?);
        let id = data.group_key_id.as_str();
        let verify_key = exported(id, ALG_SIGN, data.verify_key.clone(), None)?;

        Ok(UserKey {
            group_key_id: id.to_string(),
            group_key: export(id, ALG_SYM, &user_key[..])?,
            private_key: export(id, ALG_ASYM, &private)?,
            public_key: exported(id, ALG_ASYM, data.public_key.clone(), None)?,
            sign_key: export(id, ALG_SIGN, &sign)?,
            exported_public_key: exported(
                id,
                ALG_ASYM,
                data.public_key.clone(),
                Some(data.public_key_sig.clone()),
            )?,
            exported_verify_key: verify_key.clone(),
            verify_key,
            time: data.time,
        })
    }

    fn decrypt_aux_key(&self, group_key: &str, key_data: &str) -> CryptoResult<String> {
        let (group, raw) = import(group_key, ALG_SYM)?;
        let aux = to_secret(&Zeroizing::new(open(&raw, &STANDARD.decode(key_data)?)?))?;
        export(&group.key_id, ALG_AUX, &aux[..])
    }

    fn prepare_create_group(
        &self,
        creator_public_key: &str,
        sign_key: Option<&str>,
        starter: &str,
    ) -> CryptoResult<String> {
        let (creator, creator_key) = public_key(creator_public_key)?;
        let generation = new_generation()?;
        let (signed_by_user_id, signed_by_user_sign_key_id, group_key_sig) =
            sign_generation(sign_key, starter, &generation)?;

        let input = CreateGroupInput {
            encrypted_group_key: STANDARD.encode(seal_for(&creator_key, &generation.key[..])?),
            creator_public_key_id: creator.key_id,
            encrypted_private_group_key: generation.encrypted_private_group_key.clone(),
            public_group_key: generation.public_group_key.clone(),
            encrypted_hmac_key: STANDARD.encode(seal(&generation.key, &random_secret()[..])?),
            encrypted_sortable_key: STANDARD.encode(seal(&generation.key, &random_secret()[..])?),
            signed_by_user_id,
            signed_by_user_sign_key_id,
            group_key_sig,
        };
        Ok(serde_json::to_string(&input)?)
    }

    fn prepare_keys_for_new_member(
        &self,
        member_public_key: &str,
        group_keys: &[&str],
        key_count: usize,
        rank: Option<i32>,
    ) -> CryptoResult<String> {
        let (member, member_key) = public_key(member_public_key)?;
        let keys = group_keys
            .iter()
            .map(|key| {
                let (exported, raw) = import(key, ALG_SYM)?;
                Ok(NewMemberKey {
                    group_key_id: exported.key_id,
                    encrypted_group_key: STANDARD.encode(seal_for(&member_key, &raw[..])?),
                    public_key_id: member.key_id.clone(),
                })
            })
            .collect::<CryptoResult<Vec<_>>>()?;

        Ok(serde_json::to_string(&NewMemberKeysInput {
            keys,
            key_count,
            rank,
        })?)
    }

    fn prepare_key_rotation(
        &self,
        pre_group_key: &str,
        invoker_public_key: &str,
        sign_key: Option<&str>,
        starter: &str,
    ) -> CryptoResult<String> {
        let (input, _) = rotation_input(pre_group_key, invoker_public_key, sign_key, starter)?;
        Ok(serde_json::to_string(&input)?)
    }

    fn prepare_user_key_rotation(
        &self,
        pre_user_key: &str,
        device_public_key: &str,
    ) -> CryptoResult<String> {
        let (mut input, generation) = rotation_input(pre_user_key, device_public_key, None, "")?;
        let (encrypted_sign_key, verify_key, public_key_sig) = user_sign_pair(&generation)?;
        input.encrypted_sign_key = Some(encrypted_sign_key);
        input.verify_key = Some(verify_key);
        input.public_key_sig = Some(public_key_sig);
        Ok(serde_json::to_string(&input)?)
    }

    fn done_key_rotation(
        &self,
        server_output: &str,
        pre_group_key: &str,
        public_key: &str,
        private_key: &str,
    ) -> CryptoResult<String> {
        let out: KeyRotationServerOutput = serde_json::from_str(server_output)?;
        let (_, pre_raw) = import(pre_group_key, ALG_SYM)?;
        let (target, target_key) = self::public_key(public_key)?;
        let (private, secret) = self::private_key(private_key)?;

        if private.key_id != out.encrypted_eph_key_key_id {
            return Err(CryptoError::InvalidKey(format!(
                "rotation record is wrapped for key {}, got {}",
                out.encrypted_eph_key_key_id, private.key_id
            )));
        }

        let sealed_ephemeral = Zeroizing::new(open_with(
            &secret,
            &STANDARD.decode(&out.encrypted_ephemeral_key_by_group_key_and_public_key)?,
        )?);
        let ephemeral = to_secret(&Zeroizing::new(open(&pre_raw, &sealed_ephemeral)?))?;
        let new_key = to_secret(&Zeroizing::new(open(
            &ephemeral,
            &STANDARD.decode(&out.encrypted_group_key_by_ephemeral)?,
        )?))?;

        Ok(serde_json::to_string(&DoneKeyRotationInput {
            encrypted_new_group_key: STANDARD.encode(seal_for(&target_key, &new_key[..])?),
            public_key_id: target.key_id,
        })?)
    }

    fn split_head(&self, data: &[u8]) -> CryptoResult<EncryptedHead> {
        unframe(data).map(|(head, _)| head)
    }

    fn encrypt_symmetric(
        &self,
        key: &str,
        data: &[u8],
        sign_key: Option<&str>,
    ) -> CryptoResult<Vec<u8>> {
        let (exported, raw) = import(key, ALG_SYM)?;
        let (sign, body) = sign_body(sign_key, seal(&raw, data)?)?;
        frame(
            &EncryptedHead {
                id: exported.key_id,
                sign,
            },
            &body,
        )
    }

    fn decrypt_symmetric(
        &self,
        key: &str,
        data: &[u8],
        verify_key: Option<&str>,
    ) -> CryptoResult<Vec<u8>> {
        let (head, body) = unframe(data)?;
        let (exported, raw) = import(key, ALG_SYM)?;
        check_head_id(&head, &exported)?;
        open(&raw, check_body(&head, body, verify_key)?)
    }

    fn encrypt_asymmetric(
        &self,
        public_key: &str,
        data: &[u8],
        sign_key: Option<&str>,
    ) -> CryptoResult<Vec<u8>> {
        let (exported, key) = self::public_key(public_key)?;
        let (sign, body) = sign_body(sign_key, seal_for(&key, data)?)?;
        frame(
            &EncryptedHead {
                id: exported.key_id,
                sign,
            },
            &body,
        )
    }

    fn decrypt_asymmetric(
        &self,
        private_key: &str,
        data: &[u8],
        verify_key: Option<&str>,
    ) -> CryptoResult<Vec<u8>> {
        let (head, body) = unframe(data)?;
        let (exported, secret) = self::private_key(private_key)?;
        check_head_id(&head, &exported)?;
        open_with(&secret, check_body(&head, body, verify_key)?)
    }

    fn verify_user_public_key(&self, verify_key: &str, public_key: &str) -> CryptoResult<bool> {
        let (exported, bytes) = import(public_key, ALG_ASYM)?;
        let Some(sig) = exported.sig else {
            return Ok(false);
        };
        let key = verifying_key(verify_key)?;
        Ok(verify_signature(&key, &bytes[..], &STANDARD.decode(sig)?).is_ok())
    }

    fn create_safety_number(
        &self,
        own: (&str, &str),
        other: Option<(&str, &str)>,
    ) -> CryptoResult<String> {
        let mut pairs = vec![(own.0, verifying_key(own.1)?)];
        if let Some((user_id, verify_key)) = other {
            pairs.push((user_id, verifying_key(verify_key)?));
        }
        pairs.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.as_bytes().cmp(b.1.as_bytes())));

        let mut hasher = Sha256::new();
        for (user_id, key) in &pairs {
            hasher.update((user_id.len() as u64).to_be_bytes());
            hasher.update(user_id.as_bytes());
            hasher.update(key.as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }

    fn generate_non_registered_key(&self, master_key: &str) -> CryptoResult<(String, String)> {
        let (master, master_raw) = import(master_key, ALG_SYM)?;
        let raw = random_secret();
        let key_id = random_id();
        let wrapped = NonRegisteredKey {
            master_key_id: master.key_id,
            key_id: key_id.clone(),
            encrypted_key: STANDARD.encode(seal(&master_raw, &raw[..])?),
        };
        Ok((
            export(&key_id, ALG_SYM, &raw[..])?,
            serde_json::to_string(&wrapped)?,
        ))
    }

    fn decrypt_non_registered_key(
        &self,
        master_key: &str,
        wrapped_key: &str,
    ) -> CryptoResult<String> {
        let wrapped: NonRegisteredKey = serde_json::from_str(wrapped_key)?;
        let (master, master_raw) = import(master_key, ALG_SYM)?;
        if master.key_id != wrapped.master_key_id {
            return Err(CryptoError::InvalidKey(format!(
                "key is wrapped by {}, got {}",
                wrapped.master_key_id, master.key_id
            )));
        }
        let raw = to_secret(&Zeroizing::new(open(
            &master_raw,
            &STANDARD.decode(&wrapped.encrypted_key)?,
        )?))?;
        export(&wrapped.key_id, ALG_SYM, &raw[..])
    }

    fn prepare_register_sym_key(&self, master_key: &str) -> CryptoResult<String> {
        let (master, master_raw) = import(master_key, ALG_SYM)?;
        Ok(serde_json::to_string(&RegisterSymKeyInput {
            master_key_id: master.key_id,
            encrypted_key: STANDARD.encode(seal(&master_raw, &random_secret()[..])?),
        })?)
    }

    fn decrypt_sym_key(&self, master_key: &str, data: &SymKeyServerData) -> CryptoResult<String> {
        let (master, master_raw) = import(master_key, ALG_SYM)?;
        if master.key_id != data.master_key_id {
            return Err(CryptoError::InvalidKey(format!(
                "key is wrapped by {}, got {}",
                data.master_key_id, master.key_id
            )));
        }
        let raw = to_secret(&Zeroizing::new(open(
            &master_raw,
            &STANDARD.decode(&data.encrypted_key)?,
        )?))?;
        export(&data.key_id, ALG_SYM, &raw[..])
    }

    fn create_searchable(
        &self,
        hmac_key: &str,
        data: &str,
        full: bool,
        limit: Option<usize>,
    ) -> CryptoResult<Vec<String>> {
        let (_, raw) = import(hmac_key, ALG_AUX)?;
        search::searchable_tokens(&raw[..], data, full, limit)
    }

    fn search(&self, hmac_key: &str, data: &str) -> CryptoResult<String> {
        let (_, raw) = import(hmac_key, ALG_AUX)?;
        search::search_token(&raw[..], data)
    }

    fn sortable_encrypt_number(&self, key: &str, number: u64) -> CryptoResult<u64> {
        let value = u32::try_from(number).map_err(|_| {
            CryptoError::InvalidInput(format!("sortable numbers must not exceed {}", u32::MAX))
        })?;
        let (_, raw) = import(key, ALG_AUX)?;
        search::sortable_encode(&raw[..], value)
    }

    fn sortable_encrypt_string(&self, key: &str, data: &str) -> CryptoResult<u64> {
        let (_, raw) = import(key, ALG_AUX)?;
        search::sortable_encode(&raw[..], search::string_prefix_value(data))
    }

    fn decode_jwt(&self, jwt: &str) -> CryptoResult<JwtClaims> {
        let mut parts = jwt.split('.');
        let (Some(_), Some(payload), Some(_), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CryptoError::InvalidInput("malformed jwt".to_string()));
        };
        let payload = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
        serde_json::from_slice(&payload)
            .map_err(|e| CryptoError::InvalidInput(format!("jwt claims: {e}")))
    }
}

// ==================== Server Role ====================

/// Operations a key server (or a test double of one) performs with the
/// records of this provider.
#[cfg(any(test, feature = "test-utils"))]
impl DefaultCrypto {
    /// Generates the keys of a new device.
    ///
    /// # Errors
    ///
    /// Returns an error if a key cannot be serialized.
    pub fn generate_device_keys(device_key_id: &str) -> CryptoResult<crate::user::DeviceKeys> {
        let secret = random_secret();
        let public = PublicKey::from(&StaticSecret::from(*secret));
        let sign_secret = random_secret();
        let verify = SigningKey::from_bytes(&sign_secret).verifying_key();

        let public_key = export(device_key_id, ALG_ASYM, public.as_bytes())?;
        let verify_key = export(device_key_id, ALG_SIGN, verify.as_bytes())?;
        Ok(crate::user::DeviceKeys {
            private_key: export(device_key_id, ALG_ASYM, &secret[..])?,
            exported_public_key: public_key.clone(),
            public_key,
            sign_key: export(device_key_id, ALG_SIGN, &sign_secret[..])?,
            exported_verify_key: verify_key.clone(),
            verify_key,
        })
    }

    /// Creates a first user key generation wrapped for a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device key is invalid.
    pub fn create_user_key_data(
        device_public_key: &str,
        key_id: &str,
        time: u64,
    ) -> CryptoResult<UserKeyData> {
        let (device, device_key) = public_key(device_public_key)?;
        let generation = new_generation()?;
        let (encrypted_sign_key, verify_key, public_key_sig) = user_sign_pair(&generation)?;
        Ok(UserKeyData {
            group_key_id: key_id.to_string(),
            time,
            encrypted_group_key: STANDARD.encode(seal_for(&device_key, &generation.key[..])?),
            device_key_id: device.key_id,
            encrypted_private_key: generation.encrypted_private_group_key.clone(),
            public_key: generation.public_group_key.clone(),
            encrypted_sign_key,
            verify_key,
            public_key_sig,
        })
    }

    /// Wraps the sealed ephemeral key of a rotation for one member.
    ///
    /// # Errors
    ///
    /// Returns an error if the member key or the sealed key is invalid.
    pub fn wrap_ephemeral_key(
        member_public_key: &str,
        encrypted_ephemeral_key: &str,
    ) -> CryptoResult<String> {
        let (_, member) = public_key(member_public_key)?;
        let sealed = STANDARD.decode(encrypted_ephemeral_key)?;
        Ok(STANDARD.encode(seal_for(&member, &sealed)?))
    }

    /// Exports a public key received in a server record.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be serialized.
    pub fn export_public_key(key_id: &str, public_key: &str) -> CryptoResult<String> {
        exported(key_id, ALG_ASYM, public_key.to_string(), None)
    }

    /// Exports a verify key received in a server record.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be serialized.
    pub fn export_verify_key(key_id: &str, verify_key: &str) -> CryptoResult<String> {
        exported(key_id, ALG_SIGN, verify_key.to_string(), None)
    }

    /// Exports a signed user public key received in a server record.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be serialized.
    pub fn export_signed_public_key(
        key_id: &str,
        public_key: &str,
        signature: &str,
    ) -> CryptoResult<String> {
        exported(
            key_id,
            ALG_ASYM,
            public_key.to_string(),
            Some(signature.to_string()),
        )
    }

    /// Encodes unsigned JWT claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the claims cannot be serialized.
    pub fn encode_unsigned_jwt(claims: &JwtClaims) -> CryptoResult<String> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        Ok(format!("{header}.{payload}.unsigned"))
    }
}
