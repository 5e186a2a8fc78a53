//! Cryptographic primitives for the vault
//!
//! - **[`Secret`]**: the 256-bit vault key, ChaCha20-Poly1305 sealing
//! - **[`EntryCipher`]**: the crypto service the tree is constructed with
//! - **[`SecretCipher`]**: the default service, one key for every blob
//!
//! # Blob naming
//!
//! Every node-version, index snapshot and tag snapshot is a blob whose
//! filename is itself encrypted. The first character of a filename is the
//! plaintext type digit so blobs can be partitioned before anything else is
//! decrypted; the rest is the sealed `{id, ts, name}` triple. Filenames
//! longer than [`MAX_FILENAME_LENGTH`] are cut and marked, with the tail
//! stored in the body.
//!
//! Content digests ([`content_digest`]) let recovery compare two versions
//! without keeping their plaintext around.

mod cipher;
mod secret;

pub use cipher::{
    is_overflowing, pack_body, random_id, random_string, unpack_body, CipherError, EntryCipher,
    SecretCipher, BODY_DELIMITER, MAX_FILENAME_LENGTH, OVERFLOW_MARKER,
};
pub use secret::{Secret, SecretError, NONCE_SIZE, SECRET_SIZE};

/// BLAKE3 digest of a version's plaintext content
pub fn content_digest(content: &str) -> blake3::Hash {
    blake3::hash(content.as_bytes())
}
