// src/core/credentials/cipher.rs

//! AES-256-GCM unwrapping of the session blob.
//!
//! Blob format: `base64(nonce[12] || ciphertext || tag[16])`.

use crate::core::RealtimeError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Turns the stored ciphertext into the plaintext session JSON.
/// Implementations must be synchronous and side-effect free.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, RealtimeError>;
}

pub struct AesGcmDecryptor {
    cipher: Aes256Gcm,
}

impl AesGcmDecryptor {
    /// Creates a decryptor from a base64-encoded 256-bit key.
    pub fn new(key_base64: &str) -> Result<Self, RealtimeError> {
        let key_bytes = STANDARD.decode(key_base64.trim())?;
        if key_bytes.len() != KEY_LEN {
            return Err(RealtimeError::Crypto(format!(
                "key must be {KEY_LEN} bytes, got {}",
                key_bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| RealtimeError::Crypto(format!("invalid key: {e}")))?;
        Ok(Self { cipher })
    }

    /// Wraps `plaintext` in the same format `decrypt` expects. Used to seed
    /// session stores.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, RealtimeError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce_bytes)
            .map_err(|e| RealtimeError::Crypto(format!("failed to generate nonce: {e}")))?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| RealtimeError::Crypto(format!("AES-GCM encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }
}

impl Decryptor for AesGcmDecryptor {
    fn decrypt(&self, ciphertext: &str) -> Result<String, RealtimeError> {
        let raw = STANDARD.decode(ciphertext.trim())?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(RealtimeError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| RealtimeError::Crypto(format!("AES-GCM decryption failed: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| RealtimeError::Crypto(format!("plaintext is not UTF-8: {e}")))
    }
}
