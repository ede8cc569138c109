//! Authenticated encryption of secrets at rest (private keys, provider tokens)
//!
//! AES-256-GCM with a process-wide master key. Ciphertext (with the appended
//! tag) and the 96-bit nonce are stored as separate base64 strings.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Master key length in bytes
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CipherError {
    /// No master key configured; secret-dependent operations are unavailable
    #[error("master key not configured (set PORTICO_MASTER_KEY)")]
    KeyUnavailable,

    #[error("invalid master key: {0}")]
    InvalidKey(String),

    #[error("invalid encoding: {0}")]
    Encoding(String),

    #[error("decryption failed: ciphertext or nonce was tampered with or sealed under another key")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,
}

/// A sealed secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: String,
    pub nonce: String,
}

/// Encrypts and decrypts secrets with the master key.
///
/// A cipher built with [`SecretCipher::disabled`] returns
/// [`CipherError::KeyUnavailable`] from every operation.
#[derive(Clone)]
pub struct SecretCipher {
    key: Option<Arc<LessSafeKey>>,
    rng: SystemRandom,
}

impl SecretCipher {
    pub fn new(master_key: &[u8]) -> Result<Self, CipherError> {
        if master_key.len() != KEY_LEN {
            return Err(CipherError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                master_key.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, master_key)
            .map_err(|_| CipherError::InvalidKey("rejected by AES-256-GCM".to_string()))?;

        Ok(Self {
            key: Some(Arc::new(LessSafeKey::new(unbound))),
            rng: SystemRandom::new(),
        })
    }

    /// Build from a base64-encoded master key
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        Self::new(&raw)
    }

    /// Build from an optional base64 key; `None` or an empty string yields a disabled cipher
    pub fn from_optional(encoded: Option<&str>) -> Result<Self, CipherError> {
        match encoded.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => Self::from_base64(key),
            None => Ok(Self::disabled()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            key: None,
            rng: SystemRandom::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed, CipherError> {
        let key = self.key.as_ref().ok_or(CipherError::KeyUnavailable)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CipherError::Encrypt)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CipherError::Encrypt)?;

        Ok(Sealed {
            ciphertext: STANDARD.encode(&in_out),
            nonce: STANDARD.encode(nonce_bytes),
        })
    }

    pub fn decrypt(&self, ciphertext: &str, nonce: &str) -> Result<Vec<u8>, CipherError> {
        let key = self.key.as_ref().ok_or(CipherError::KeyUnavailable)?;

        let nonce_raw = STANDARD
            .decode(nonce)
            .map_err(|e| CipherError::Encoding(e.to_string()))?;
        let nonce_bytes: [u8; NONCE_LEN] = nonce_raw
            .as_slice()
            .try_into()
            .map_err(|_| CipherError::Encoding(format!("nonce must be {NONCE_LEN} bytes")))?;
        let mut in_out = STANDARD
            .decode(ciphertext)
            .map_err(|e| CipherError::Encoding(e.to_string()))?;

        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CipherError::Decrypt)?;
        Ok(plaintext.to_vec())
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<Sealed, CipherError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_string(&self, ciphertext: &str, nonce: &str) -> Result<String, CipherError> {
        let raw = self.decrypt(ciphertext, nonce)?;
        String::from_utf8(raw).map_err(|e| CipherError::Encoding(e.to_string()))
    }

    /// Generate a fresh base64 master key
    pub fn generate_key() -> Result<String, CipherError> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| CipherError::InvalidKey("system random source failed".to_string()))?;
        Ok(STANDARD.encode(key))
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
