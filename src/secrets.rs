//! At-rest codec for bot secrets.
//!
//! AES-256-GCM with a per-value key derived from the master key via
//! HKDF-SHA256 and a random salt. The stored form is four standard-base64
//! fields joined by colons:
//!
//! ```text
//! salt:iv:tag:data
//! ```
//!
//! Every failure mode (short master key, malformed input, wrong key,
//! tampering) returns an error; nothing ever decrypts to garbage.

use aes_gcm::aead::{AeadCore, AeadInPlace, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce, Tag};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::SecretsError;

/// Minimum accepted master key length, in characters.
pub const MIN_MASTER_KEY_LEN: usize = 32;

const KEY_SIZE: usize = 32;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const HKDF_INFO: &[u8] = b"botvisor-secrets-v1";

/// Encrypt `plaintext` under `master_key`. Two calls with the same input
/// produce different ciphertexts.
pub fn encrypt(plaintext: &str, master_key: &str) -> Result<String, SecretsError> {
    check_master_key(master_key)?;

    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let cipher = cipher_for(master_key, &salt)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut data = plaintext.as_bytes().to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, b"", &mut data)
        .map_err(|_| SecretsError::EncryptionFailed)?;

    Ok([
        STANDARD.encode(salt),
        STANDARD.encode(nonce),
        STANDARD.encode(tag),
        STANDARD.encode(&data),
    ]
    .join(":"))
}

/// Decrypt a value produced by [`encrypt`].
pub fn decrypt(ciphertext: &str, master_key: &str) -> Result<String, SecretsError> {
    check_master_key(master_key)?;

    let parts: Vec<&str> = ciphertext.split(':').collect();
    let [salt, iv, tag, data] = parts.as_slice() else {
        return Err(SecretsError::Malformed(format!(
            "expected 4 fields, found {}",
            parts.len()
        )));
    };

    let salt = decode_field("salt", salt)?;
    let iv = decode_field("iv", iv)?;
    let tag = decode_field("tag", tag)?;
    let mut data = decode_field("data", data)?;

    if salt.is_empty() {
        return Err(SecretsError::Malformed("empty salt".into()));
    }
    if iv.len() != NONCE_SIZE {
        return Err(SecretsError::Malformed(format!(
            "iv must be {NONCE_SIZE} bytes, got {}",
            iv.len()
        )));
    }
    if tag.len() != TAG_SIZE {
        return Err(SecretsError::Malformed(format!(
            "tag must be {TAG_SIZE} bytes, got {}",
            tag.len()
        )));
    }

    let cipher = cipher_for(master_key, &salt)?;
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&iv),
            b"",
            &mut data,
            Tag::from_slice(&tag),
        )
        .map_err(|_| SecretsError::DecryptionFailed)?;

    String::from_utf8(data).map_err(|_| SecretsError::InvalidUtf8)
}

/// Codec bound to one master key, so callers holding a [`SecretString`]
/// never have to expose it themselves.
pub struct SecretsCodec {
    master_key: SecretString,
}

impl SecretsCodec {
    pub fn new(master_key: SecretString) -> Result<Self, SecretsError> {
        check_master_key(master_key.expose_secret())?;
        Ok(Self { master_key })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretsError> {
        encrypt(plaintext, self.master_key.expose_secret())
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<SecretString, SecretsError> {
        decrypt(ciphertext, self.master_key.expose_secret()).map(SecretString::from)
    }
}

impl std::fmt::Debug for SecretsCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsCodec")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

fn check_master_key(master_key: &str) -> Result<(), SecretsError> {
    if master_key.chars().count() < MIN_MASTER_KEY_LEN {
        return Err(SecretsError::InvalidMasterKey {
            min: MIN_MASTER_KEY_LEN,
        });
    }
    Ok(())
}

fn cipher_for(master_key: &str, salt: &[u8]) -> Result<Aes256Gcm, SecretsError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), master_key.as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(HKDF_INFO, &mut key[..])
        .map_err(|_| SecretsError::EncryptionFailed)?;
    Aes256Gcm::new_from_slice(&key[..]).map_err(|_| SecretsError::EncryptionFailed)
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, SecretsError> {
    STANDARD
        .decode(value)
        .map_err(|e| SecretsError::Malformed(format!("{name} is not valid base64: {e}")))
}
