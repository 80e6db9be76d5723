//! Descriptor sealing and password digests.
//!
//! Descriptors are sealed with AES-256-GCM under a key derived from a secret
//! by SHA-256. The default secret is embedded in the binary: this hides the
//! descriptor from casual inspection of the database file and nothing more.
//! Anyone who can read the binary can recover the key. Supply a secret from a
//! platform keystore via [`StoreKey::from_secret`] for real protection.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;

const EMBEDDED_SECRET: &[u8] = b"faceguard-local-descriptor-key-v1";
const NONCE_LEN: usize = 12;
const DIGEST_TAG: &str = "sha256";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    Seal,
    #[error("ciphertext too short or tampered")]
    Open,
}

/// Symmetric key for descriptor sealing.
#[derive(Clone)]
pub struct StoreKey([u8; 32]);

impl StoreKey {
    /// Key derived from the application-embedded secret.
    pub fn embedded() -> Self {
        Self::from_secret(EMBEDDED_SECRET)
    }

    pub fn from_secret(secret: &[u8]) -> Self {
        let digest = Sha256::digest(secret);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// Encrypt `plaintext`. Output layout: nonce (12 bytes) || ciphertext+tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Seal)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::Open);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Open)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreKey(..)")
    }
}

/// One-way password digest, tagged with its algorithm: `sha256:<hex>`.
pub fn password_digest(password: &str) -> String {
    format!("{DIGEST_TAG}:{}", hex::encode(Sha256::digest(password.as_bytes())))
}

/// Check `password` against a stored tagged digest. Unknown tags never match.
pub fn verify_digest(stored: &str, password: &str) -> bool {
    let Some((tag, _)) = stored.split_once(':') else {
        return false;
    };
    if tag != DIGEST_TAG {
        return false;
    }
    stored
        .as_bytes()
        .ct_eq(password_digest(password).as_bytes())
        .into()
}
