use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use argon2::{
    password_hash::{rand_core::RngCore, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::EnvelopeConfig;

pub const ENVELOPE_VERSION: u8 = 1;
pub const ENVELOPE_ALG: &str = "aes-256-gcm";

const DEK_LEN: usize = 32;
const TAG_LEN: usize = 16;
const HKDF_INFO: &[u8] = b"wallet-kek-v1";
const LEGACY_KDF_SALT: &[u8] = b"wallet-legacy-v0";
const LEGACY_KDF_ROUNDS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD tag mismatch while opening the KEK-wrapped DEK.
    #[error("invalid passphrase")]
    BadPassphrase,
    #[error("corrupt envelope: {0}")]
    CorruptEnvelope(String),
    #[error("unsupported legacy secret format")]
    UnsupportedLegacyFormat,
}

/// One AEAD ciphertext with its nonce and tag, all hex.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AeadBox {
    pub nonce: String,
    pub ct: String,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct KekSpec {
    pub salt: String,
    pub params: KekParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct KekParams {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

/// Persisted wallet-secret envelope. Protected envelopes carry a
/// pass-phrase-derived KEK wrapping the DEK; unprotected envelopes derive
/// the wrapping key from the server secret alone and omit the kek fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Envelope {
    pub v: u8,
    pub alg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kek: Option<KekSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kek_wrapped_dek: Option<AeadBox>,
    pub wrapped: AeadBox,
}

impl Envelope {
    pub fn is_protected(&self) -> bool {
        self.kek_wrapped_dek.is_some()
    }

    fn check_shape(&self) -> Result<(), CryptoError> {
        if self.v != ENVELOPE_VERSION {
            return Err(CryptoError::CorruptEnvelope(format!("version {}", self.v)));
        }
        if self.alg != ENVELOPE_ALG {
            return Err(CryptoError::CorruptEnvelope(format!("alg {}", self.alg)));
        }
        if self.kek.is_some() != self.kek_wrapped_dek.is_some() {
            return Err(CryptoError::CorruptEnvelope("kek fields must travel together".into()));
        }
        Ok(())
    }
}

/// AAD binding string for a (user, wallet) pair. Not stored; recomputed on
/// every wrap and unwrap so a copied envelope fails on any other row.
pub fn aad_for(user_id: &str, wallet_id: &str) -> String {
    format!("user:{}:wallet:{}", user_id, wallet_id)
}

fn seal(key: &[u8; 32], plaintext: &[u8], aad: &str) -> Result<AeadBox, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut ct = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad: aad.as_bytes() })
        .map_err(|_| CryptoError::CorruptEnvelope("seal failed".into()))?;

    let tag = ct.split_off(ct.len() - TAG_LEN);
    Ok(AeadBox {
        nonce: hex::encode(nonce),
        ct: hex::encode(&ct),
        tag: hex::encode(&tag),
    })
}

fn open(key: &[u8; 32], boxed: &AeadBox, aad: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let nonce_bytes =
        hex::decode(&boxed.nonce).map_err(|_| CryptoError::CorruptEnvelope("nonce hex".into()))?;
    if nonce_bytes.len() != 12 {
        return Err(CryptoError::CorruptEnvelope("nonce length".into()));
    }
    let mut full = hex::decode(&boxed.ct).map_err(|_| CryptoError::CorruptEnvelope("ct hex".into()))?;
    let tag = hex::decode(&boxed.tag).map_err(|_| CryptoError::CorruptEnvelope("tag hex".into()))?;
    if tag.len() != TAG_LEN {
        return Err(CryptoError::CorruptEnvelope("tag length".into()));
    }
    full.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: &full, aad: aad.as_bytes() })
        .map_err(|_| CryptoError::BadPassphrase)?;
    Ok(Zeroizing::new(plaintext))
}

fn derive_kek(passphrase: &str, salt: &[u8], params: &KekParams) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let argon = Argon2::new(
        Algorithm::Argon2id,
        Version::V0x13,
        Params::new(params.m_cost, params.t_cost, params.p_cost, Some(DEK_LEN))
            .map_err(|e| CryptoError::CorruptEnvelope(format!("argon2 params: {e}")))?,
    );
    let mut kek = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(passphrase.as_bytes(), salt, kek.as_mut())
        .map_err(|e| CryptoError::CorruptEnvelope(format!("argon2: {e}")))?;
    Ok(kek)
}

fn derive_unprotected_kek(server_secret: &str, user_id: &str) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(user_id.as_bytes()), server_secret.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    // Expand only fails on absurd output lengths; 32 bytes is always fine.
    hk.expand(HKDF_INFO, key.as_mut()).unwrap();
    key
}

/// Wrap a raw wallet secret under a fresh DEK and a pass-phrase-derived KEK.
/// Returns the envelope together with the DEK so arming can proceed without
/// a second unwrap.
pub fn encrypt_secret(
    plaintext: &[u8],
    passphrase: &str,
    aad: &str,
    cfg: &EnvelopeConfig,
) -> Result<(Envelope, Zeroizing<[u8; 32]>), CryptoError> {
    let mut dek = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(dek.as_mut());

    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let params = KekParams {
        m_cost: cfg.argon2_memory_kib,
        t_cost: cfg.argon2_iterations,
        p_cost: cfg.argon2_parallelism,
    };

    let kek = derive_kek(passphrase, &salt, &params)?;
    let kek_wrapped_dek = seal(&kek, dek.as_ref(), aad)?;
    let wrapped = seal(&dek, plaintext, aad)?;

    let envelope = Envelope {
        v: ENVELOPE_VERSION,
        alg: ENVELOPE_ALG.to_string(),
        kek: Some(KekSpec { salt: hex::encode(salt), params }),
        kek_wrapped_dek: Some(kek_wrapped_dek),
        wrapped,
    };
    Ok((envelope, dek))
}

/// Recover the DEK from a protected envelope. A wrong pass-phrase or a
/// foreign AAD surfaces as `BadPassphrase` (the AEAD tag cannot tell them
/// apart, and neither should callers).
pub fn unwrap_dek(
    envelope: &Envelope,
    passphrase: &str,
    aad: &str,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    envelope.check_shape()?;
    let kek_spec = envelope
        .kek
        .as_ref()
        .ok_or_else(|| CryptoError::CorruptEnvelope("missing kek".into()))?;
    let wrapped_dek = envelope
        .kek_wrapped_dek
        .as_ref()
        .ok_or_else(|| CryptoError::CorruptEnvelope("missing kekWrappedDek".into()))?;

    let salt =
        hex::decode(&kek_spec.salt).map_err(|_| CryptoError::CorruptEnvelope("kek salt hex".into()))?;
    let kek = derive_kek(passphrase, &salt, &kek_spec.params)?;

    let dek_bytes = open(&kek, wrapped_dek, aad)?;
    if dek_bytes.len() != DEK_LEN {
        return Err(CryptoError::CorruptEnvelope("dek length".into()));
    }
    let mut dek = Zeroizing::new([0u8; 32]);
    dek.copy_from_slice(&dek_bytes);
    Ok(dek)
}

/// Open the secret itself with an already-unwrapped DEK.
pub fn decrypt_secret_with_dek(
    envelope: &Envelope,
    dek: &[u8; 32],
    aad: &str,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    envelope.check_shape()?;
    open(dek, &envelope.wrapped, aad)
}

/// Wrap a secret under the HKDF(server_secret, user_id) key alone. Used for
/// wallets whose owner has not set a pass-phrase.
pub fn encrypt_unprotected(
    plaintext: &[u8],
    user_id: &str,
    server_secret: &str,
    aad: &str,
) -> Result<Envelope, CryptoError> {
    let key = derive_unprotected_kek(server_secret, user_id);
    let wrapped = seal(&key, plaintext, aad)?;
    Ok(Envelope {
        v: ENVELOPE_VERSION,
        alg: ENVELOPE_ALG.to_string(),
        kek: None,
        kek_wrapped_dek: None,
        wrapped,
    })
}

pub fn decrypt_unprotected(
    envelope: &Envelope,
    user_id: &str,
    server_secret: &str,
    aad: &str,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    envelope.check_shape()?;
    if envelope.is_protected() {
        return Err(CryptoError::CorruptEnvelope("envelope is passphrase-protected".into()));
    }
    let key = derive_unprotected_kek(server_secret, user_id);
    open(&key, &envelope.wrapped, aad)
}

/// Decrypt the pre-envelope `iv:tag:ciphertext` hex format written under a
/// PBKDF2-stretched server key. Accepted on arm only, then migrated.
pub fn decrypt_legacy(blob: &str, server_secret: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let parts: Vec<&str> = blob.split(':').collect();
    if parts.len() != 3 {
        return Err(CryptoError::UnsupportedLegacyFormat);
    }
    let iv = hex::decode(parts[0]).map_err(|_| CryptoError::UnsupportedLegacyFormat)?;
    let tag = hex::decode(parts[1]).map_err(|_| CryptoError::UnsupportedLegacyFormat)?;
    let ct = hex::decode(parts[2]).map_err(|_| CryptoError::UnsupportedLegacyFormat)?;
    if iv.len() != 12 || tag.len() != TAG_LEN {
        return Err(CryptoError::UnsupportedLegacyFormat);
    }

    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(server_secret.as_bytes(), LEGACY_KDF_SALT, LEGACY_KDF_ROUNDS, key.as_mut());

    let mut full = ct;
    full.extend_from_slice(&tag);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), full.as_slice())
        .map_err(|_| CryptoError::UnsupportedLegacyFormat)?;
    Ok(Zeroizing::new(plaintext))
}

/// Argon2id PHC hash of a pass-phrase, stored on the wallet row so a wrong
/// pass-phrase is rejected before any KDF-and-unwrap work.
pub fn hash_passphrase(passphrase: &str) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(passphrase.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| CryptoError::CorruptEnvelope(format!("passphrase hash: {e}")))
}

pub fn verify_passphrase(passphrase: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(passphrase.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Produce the `iv:tag:ciphertext` blob the migrator accepts. Exists for
/// import tooling and the migration tests; the engine never writes this
/// format for new wallets.
pub fn build_legacy_test_blob(secret: &[u8], server_secret: &str) -> String {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(server_secret.as_bytes(), LEGACY_KDF_SALT, LEGACY_KDF_ROUNDS, key.as_mut());
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut ct = cipher.encrypt(&nonce, secret).expect("legacy seal");
    let tag = ct.split_off(ct.len() - TAG_LEN);
    format!("{}:{}:{}", hex::encode(nonce), hex::encode(tag), hex::encode(ct))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EnvelopeConfig {
        // Cheap parameters so the KDF does not dominate the test run.
        EnvelopeConfig { argon2_memory_kib: 8, argon2_iterations: 1, argon2_parallelism: 1 }
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let secret = [7u8; 64];
        let aad = aad_for("u1", "w1");
        let (envelope, dek) = encrypt_secret(&secret, "hunter2", &aad, &cfg()).unwrap();
        assert!(envelope.is_protected());

        let dek2 = unwrap_dek(&envelope, "hunter2", &aad).unwrap();
        assert_eq!(dek.as_ref(), dek2.as_ref());

        let plain = decrypt_secret_with_dek(&envelope, &dek2, &aad).unwrap();
        assert_eq!(plain.as_slice(), &secret);
    }

    #[test]
    fn wrong_passphrase_is_bad_passphrase() {
        let aad = aad_for("u1", "w1");
        let (envelope, _) = encrypt_secret(&[1u8; 64], "right", &aad, &cfg()).unwrap();
        assert!(matches!(unwrap_dek(&envelope, "wrong", &aad), Err(CryptoError::BadPassphrase)));
    }

    #[test]
    fn foreign_aad_fails() {
        let (envelope, dek) = encrypt_secret(&[2u8; 64], "p", &aad_for("u1", "w1"), &cfg()).unwrap();
        // Same user, different wallet: one changed byte in the AAD.
        assert!(unwrap_dek(&envelope, "p", &aad_for("u1", "w2")).is_err());
        assert!(decrypt_secret_with_dek(&envelope, &dek, &aad_for("u1", "w2")).is_err());
    }

    #[test]
    fn unprotected_round_trip_and_migration_shape() {
        let aad = aad_for("u9", "w9");
        let envelope = encrypt_unprotected(&[3u8; 64], "u9", "server-secret", &aad).unwrap();
        assert!(!envelope.is_protected());
        let plain = decrypt_unprotected(&envelope, "u9", "server-secret", &aad).unwrap();
        assert_eq!(plain.as_slice(), &[3u8; 64]);

        // Wrong user id changes the HKDF salt and must fail.
        assert!(decrypt_unprotected(&envelope, "u8", "server-secret", &aad).is_err());
    }

    #[test]
    fn legacy_blob_round_trip() {
        let secret = [9u8; 64];
        let blob = build_legacy_test_blob(&secret, "server-secret");
        let plain = decrypt_legacy(&blob, "server-secret").unwrap();
        assert_eq!(plain.as_slice(), &secret);

        assert!(matches!(
            decrypt_legacy("zz:zz", "server-secret"),
            Err(CryptoError::UnsupportedLegacyFormat)
        ));
    }

    #[test]
    fn passphrase_hash_verifies() {
        let phc = hash_passphrase("open sesame").unwrap();
        assert!(verify_passphrase("open sesame", &phc));
        assert!(!verify_passphrase("open Sesame", &phc));
    }

    #[test]
    fn envelope_json_shape() {
        let aad = aad_for("u1", "w1");
        let (envelope, _) = encrypt_secret(&[0u8; 64], "p", &aad, &cfg()).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["alg"], "aes-256-gcm");
        assert!(json["kekWrappedDek"]["nonce"].is_string());
        assert!(json["wrapped"]["tag"].is_string());
    }
}
