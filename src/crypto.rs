//! Authenticated encryption for the sticky-session cookie.
//!
//! Tokens are sealed as `nonce || ciphertext` with a random 24-byte nonce
//! per message. Anything that fails to open is treated as absent, never as
//! an error.

use anyhow::{Context, Result};
use crypto_secretbox::{
    aead::{Aead, KeyInit, OsRng},
    Nonce, XSalsa20Poly1305,
};
use rand::RngCore;

/// Length of the cookie key in bytes (256 bits)
pub const KEY_LENGTH: usize = 32;
/// Length of the nonce prefix in bytes
pub const NONCE_LENGTH: usize = 24;

/// Sealed-token codec keyed by the process-lived cookie key.
#[derive(Clone)]
pub struct CookieBox {
    cipher: XSalsa20Poly1305,
}

impl CookieBox {
    /// Create a box from a raw 32-byte key.
    pub fn new(key: &[u8; KEY_LENGTH]) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(key.into()),
        }
    }

    /// Create a box from a base64-encoded key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            .context("failed to decode base64 cookie key")?;
        if bytes.len() != KEY_LENGTH {
            anyhow::bail!(
                "invalid cookie key length: expected {}, got {}",
                KEY_LENGTH,
                bytes.len()
            );
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        Ok(Self::new(&key))
    }

    /// Generate a fresh random key.
    pub fn generate_key() -> [u8; KEY_LENGTH] {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Seal `plaintext` under a fresh random nonce, returning
    /// `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("encryption failed: {}", e))?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a `nonce || ciphertext` token. Returns `None` on any mismatch:
    /// short input, wrong key, or a tampered byte.
    pub fn open(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < NONCE_LENGTH {
            return None;
        }
        let nonce = Nonce::from_slice(&data[..NONCE_LENGTH]);
        self.cipher.decrypt(nonce, &data[NONCE_LENGTH..]).ok()
    }
}
