//! Symmetric encryption using ChaCha20-Poly1305
//!
//! The vault key is a single [`Secret`]. Every blob name and blob body is
//! sealed with it independently, each under a fresh random nonce, and then
//! rendered as URL-safe base64 so the result can be used as a filename.

use std::ops::Deref;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::Key;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};

/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
pub const SECRET_SIZE: usize = 32;

/// Errors that can occur during encryption/decryption
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("invalid secret size, expected {SECRET_SIZE}, got {0}")]
    InvalidSize(usize),
    #[error("failed to generate random bytes: {0}")]
    Random(String),
    #[error("encrypt error")]
    Encrypt,
    #[error("decrypt error")]
    Decrypt,
    #[error("data too short for nonce")]
    TooShort,
    #[error("invalid encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
}

/// A 256-bit symmetric key.
///
/// The sealed format is `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
///
/// ```ignore
/// let secret = Secret::generate()?;
/// let sealed = secret.encrypt_to_string(b"PIN: 1234")?;
/// assert_eq!(secret.decrypt_str(&sealed)?, b"PIN: 1234");
/// ```
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Secret([u8; SECRET_SIZE]);

impl Default for Secret {
    fn default() -> Self {
        Secret([0; SECRET_SIZE])
    }
}

impl Deref for Secret {
    type Target = [u8; SECRET_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; SECRET_SIZE]> for Secret {
    fn from(bytes: [u8; SECRET_SIZE]) -> Self {
        Secret(bytes)
    }
}

impl Secret {
    /// Generate a new random secret using a cryptographically secure RNG
    pub fn generate() -> Result<Self, SecretError> {
        let mut buff = [0; SECRET_SIZE];
        getrandom::getrandom(&mut buff).map_err(|e| SecretError::Random(e.to_string()))?;
        Ok(Self(buff))
    }

    /// Create a secret from a byte slice
    pub fn from_slice(data: &[u8]) -> Result<Self, SecretError> {
        if data.len() != SECRET_SIZE {
            return Err(SecretError::InvalidSize(data.len()));
        }
        let mut buff = [0; SECRET_SIZE];
        buff.copy_from_slice(data);
        Ok(buff.into())
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// Seal `data` under a fresh random nonce
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretError> {
        let key = Key::from_slice(self.bytes());
        let cipher = ChaCha20Poly1305::new(key);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes).map_err(|e| SecretError::Random(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, data)
            .map_err(|_| SecretError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(nonce.as_ref());
        out.extend_from_slice(ciphertext.as_ref());
        Ok(out)
    }

    /// Open data produced by [`Secret::encrypt`]
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretError> {
        if data.len() < NONCE_SIZE {
            return Err(SecretError::TooShort);
        }
        let key = Key::from_slice(self.bytes());
        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        let cipher = ChaCha20Poly1305::new(key);
        cipher
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|_| SecretError::Decrypt)
    }

    /// Seal and render as URL-safe base64 (no padding), usable in filenames
    pub fn encrypt_to_string(&self, data: &[u8]) -> Result<String, SecretError> {
        Ok(URL_SAFE_NO_PAD.encode(self.encrypt(data)?))
    }

    pub fn decrypt_str(&self, data: &str) -> Result<Vec<u8>, SecretError> {
        let raw = URL_SAFE_NO_PAD.decode(data)?;
        self.decrypt(&raw)
    }
}
