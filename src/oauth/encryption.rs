//! AES-256-GCM encryption of token payloads at rest.
//!
//! Sealed payloads are `nonce (12 bytes) || ciphertext+tag`. A fresh random
//! nonce is drawn for every seal; the key never leaves this module.

use std::collections::HashSet;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngExt;

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// Fewer distinct byte values than this in a 32-byte key is treated as low entropy.
const MIN_DISTINCT_KEY_BYTES: usize = 16;

/// Encryption failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncryptionError {
    /// Key is not valid base64
    #[error("encryption key is not valid base64: {0}")]
    InvalidEncoding(String),
    /// Key has the wrong length
    #[error("encryption key must be {KEY_SIZE} bytes, got {0}")]
    InvalidLength(usize),
    /// Key is all zero bytes
    #[error("encryption key must not be all zeros")]
    AllZero,
    /// Key has too little variety to be random
    #[error("encryption key has low entropy ({distinct} distinct bytes); generate it with a CSPRNG")]
    LowEntropy {
        /// Distinct byte values observed
        distinct: usize,
    },
    /// Sealed payload is shorter than a nonce
    #[error("ciphertext is truncated")]
    Truncated,
    /// Authentication failed (wrong key or tampered data)
    #[error("decryption failed")]
    Decrypt,
    /// Cipher refused to encrypt
    #[error("encryption failed")]
    Encrypt,
}

/// A validated 32-byte key. Debug output is redacted.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

impl EncryptionKey {
    /// Decode and validate a base64 key
    pub fn from_base64(encoded: &str) -> Result<Self, EncryptionError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| EncryptionError::InvalidEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Validate raw key bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncryptionError> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| EncryptionError::InvalidLength(bytes.len()))?;
        if key.iter().all(|b| *b == 0) {
            return Err(EncryptionError::AllZero);
        }
        let distinct = key.iter().collect::<HashSet<_>>().len();
        if distinct < MIN_DISTINCT_KEY_BYTES {
            return Err(EncryptionError::LowEntropy { distinct });
        }
        Ok(Self(key))
    }

    /// Generate a random key
    #[must_use]
    pub fn generate() -> Self {
        loop {
            let bytes: [u8; KEY_SIZE] = rand::rng().random();
            if let Ok(key) = Self::from_bytes(&bytes) {
                return key;
            }
        }
    }

    /// Base64 form, for `mcp-kubernetes generate-key`
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

/// Token payload cipher
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Build a cipher from a validated key
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)),
        }
    }

    /// Encrypt `plaintext` under a fresh nonce
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce_bytes: [u8; NONCE_SIZE] = rand::rng().random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| EncryptionError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a payload produced by [`seal`](Self::seal)
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if sealed.len() < NONCE_SIZE {
            return Err(EncryptionError::Truncated);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::Decrypt)
    }
}
