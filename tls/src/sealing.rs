//! Password sealing for secure store payloads.
//!
//! Keys are derived with Argon2id and payloads are sealed with
//! ChaCha20-Poly1305. Every sealed blob carries its own salt, nonce and
//! cost parameters so it can be opened with nothing but the password.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use models::KdfConfig;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("invalid key derivation parameters: {0}")]
    Params(String),
    #[error("key derivation failed: {0}")]
    Derive(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong password or tampered data)")]
    Decrypt,
    #[error("invalid encoding in sealed blob: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("sealed blob has a {field} of {actual} bytes, expected {expected}")]
    Length {
        field: &'static str,
        actual: usize,
        expected: usize,
    },
}

/// Argon2id cost parameters, persisted alongside each sealed blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfConfig::default().into()
    }
}

impl From<KdfConfig> for KdfParams {
    fn from(cfg: KdfConfig) -> Self {
        Self {
            memory_kib: cfg.memory_kib,
            iterations: cfg.iterations,
            parallelism: cfg.parallelism,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBlob {
    pub kdf: KdfParams,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

fn derive_key(
    password: &[u8],
    salt: &[u8],
    kdf: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, SealError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
        .map_err(|e| SealError::Params(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password, salt, &mut key[..])
        .map_err(|e| SealError::Derive(e.to_string()))?;
    Ok(key)
}

pub fn seal(plaintext: &[u8], password: &str, kdf: KdfParams) -> Result<SealedBlob, SealError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password.as_bytes(), &salt, &kdf)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SealError::Encrypt)?;

    Ok(SealedBlob {
        kdf,
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

pub fn open(blob: &SealedBlob, password: &str) -> Result<Zeroizing<Vec<u8>>, SealError> {
    let salt = BASE64.decode(blob.salt.as_bytes())?;
    let nonce = BASE64.decode(blob.nonce.as_bytes())?;
    let ciphertext = BASE64.decode(blob.ciphertext.as_bytes())?;
    if salt.len() != SALT_LEN {
        return Err(SealError::Length {
            field: "salt",
            actual: salt.len(),
            expected: SALT_LEN,
        });
    }
    if nonce.len() != NONCE_LEN {
        return Err(SealError::Length {
            field: "nonce",
            actual: nonce.len(),
            expected: NONCE_LEN,
        });
    }

    let key = derive_key(password.as_bytes(), &salt, &blob.kdf)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| SealError::Decrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light() -> KdfParams {
        KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn open_recovers_sealed_bytes() {
        let blob = seal(b"node private key", "s3cret", light()).unwrap();
        let opened = open(&blob, "s3cret").unwrap();
        assert_eq!(opened.as_slice(), b"node private key");
    }

    #[test]
    fn wrong_password_fails_to_open() {
        let blob = seal(b"payload", "right", light()).unwrap();
        assert!(matches!(open(&blob, "wrong"), Err(SealError::Decrypt)));
    }

    #[test]
    fn each_seal_uses_fresh_salt_and_nonce() {
        let a = seal(b"payload", "pw", light()).unwrap();
        let b = seal(b"payload", "pw", light()).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn truncated_nonce_is_rejected_before_decrypting() {
        let mut blob = seal(b"payload", "pw", light()).unwrap();
        blob.nonce = BASE64.encode([0u8; 4]);
        assert!(matches!(
            open(&blob, "pw"),
            Err(SealError::Length { field: "nonce", .. })
        ));
    }
}
