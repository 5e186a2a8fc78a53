//! Entry encryption
//!
//! Blob filenames are `<type digit><sealed {"i","t","n"}>` and blob bodies
//! are `<sealed {"i","t","c"}>`, optionally followed by `~<extra name>` when
//! the filename had to be cut to fit [`MAX_FILENAME_LENGTH`].

use std::fmt::Debug;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use super::secret::{Secret, SecretError};
use crate::entry::{Entry, EntryType, Timestamp};

/// Longest filename the storage layer is asked to create
pub const MAX_FILENAME_LENGTH: usize = 255;
/// Last character of a filename whose tail lives in the blob body
pub const OVERFLOW_MARKER: char = '~';
/// Separates the sealed content from the extra name inside a blob body
pub const BODY_DELIMITER: char = '~';

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
    #[error("missing fields: {0}")]
    MissingFields(&'static str),
    #[error("not a vault blob name: {0}")]
    InvalidName(String),
    #[error("overflowing name without extra name")]
    MissingExtraName,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("content does not belong to {0}")]
    Mismatch(String),
}

/// Crypto service consumed by the tree.
///
/// Implementations are pure functions of the entry and the key material they
/// hold; the tree never shares a session key through ambient state.
pub trait EntryCipher: Debug + Send + Sync {
    /// Fill `encrypted_name`, `encrypted_content` and, on overflow, `extra_name`
    fn encrypt_entry(&self, entry: &Entry) -> Result<Entry, CipherError>;

    /// Recover type, id, ts, name and content from the encrypted fields
    fn decrypt_entry(&self, entry: &Entry) -> Result<Entry, CipherError>;

    /// Recover type, id, ts and name from the encrypted name alone
    fn decrypt_item(&self, entry: &Entry) -> Result<Entry, CipherError>;
}

#[serde_as]
#[derive(Serialize, Deserialize)]
struct SealedName {
    i: String,
    #[serde_as(as = "DisplayFromStr")]
    t: Timestamp,
    n: String,
}

#[serde_as]
#[derive(Serialize, Deserialize)]
struct SealedContent {
    i: String,
    #[serde_as(as = "DisplayFromStr")]
    t: Timestamp,
    c: String,
}

/// [`EntryCipher`] backed by a single vault [`Secret`]
#[derive(Debug, Clone)]
pub struct SecretCipher {
    secret: Secret,
}

impl SecretCipher {
    pub fn new(secret: Secret) -> Self {
        Self { secret }
    }

    fn open_name(&self, full_name: &str) -> Result<(EntryType, SealedName), CipherError> {
        let mut chars = full_name.chars();
        let entry_type = chars
            .next()
            .and_then(EntryType::from_digit)
            .ok_or_else(|| CipherError::InvalidName(full_name.to_string()))?;
        let raw = self.secret.decrypt_str(chars.as_str())?;
        let sealed: SealedName = serde_json::from_slice(&raw)?;
        Ok((entry_type, sealed))
    }
}

impl EntryCipher for SecretCipher {
    fn encrypt_entry(&self, entry: &Entry) -> Result<Entry, CipherError> {
        let entry_type = entry.entry_type.ok_or(CipherError::MissingFields("type"))?;
        let id = entry.id.clone().ok_or(CipherError::MissingFields("id"))?;
        let ts = entry.ts.unwrap_or_else(Timestamp::now);
        let name = entry.name.clone().unwrap_or_default();

        let sealed_name = serde_json::to_vec(&SealedName {
            i: id.clone(),
            t: ts,
            n: name,
        })?;
        let mut full_name = String::with_capacity(1 + sealed_name.len() * 2);
        full_name.push(entry_type.digit());
        full_name.push_str(&self.secret.encrypt_to_string(&sealed_name)?);

        let sealed_content = serde_json::to_vec(&SealedContent {
            i: id,
            t: ts,
            c: entry.content.clone().unwrap_or_default(),
        })?;

        let mut out = entry.clone();
        out.ts = Some(ts);
        out.encrypted_content = Some(self.secret.encrypt_to_string(&sealed_content)?);
        // base64url never produces the marker, so the cut is unambiguous
        if full_name.len() > MAX_FILENAME_LENGTH {
            let (head, tail) = full_name.split_at(MAX_FILENAME_LENGTH - 1);
            out.encrypted_name = Some(format!("{}{}", head, OVERFLOW_MARKER));
            out.extra_name = Some(tail.to_string());
        } else {
            out.encrypted_name = Some(full_name);
            out.extra_name = None;
        }
        Ok(out)
    }

    fn decrypt_entry(&self, entry: &Entry) -> Result<Entry, CipherError> {
        let body = entry
            .encrypted_content
            .as_deref()
            .ok_or(CipherError::MissingFields("encrypted_content"))?;
        let (content, extra) = unpack_body(body);
        let mut with_extra = entry.clone();
        if with_extra.extra_name.is_none() {
            with_extra.extra_name = extra.map(str::to_string);
        }
        let mut out = self.decrypt_item(&with_extra)?;

        let raw = self.secret.decrypt_str(content)?;
        let sealed: SealedContent = serde_json::from_slice(&raw)?;
        if Some(&sealed.i) != out.id.as_ref() || Some(sealed.t) != out.ts {
            return Err(CipherError::Mismatch(sealed.i));
        }
        out.content = Some(sealed.c);
        out.encrypted_content = Some(content.to_string());
        Ok(out)
    }

    fn decrypt_item(&self, entry: &Entry) -> Result<Entry, CipherError> {
        let file = entry
            .encrypted_name
            .as_deref()
            .ok_or(CipherError::MissingFields("encrypted_name"))?;
        let full_name = match file.strip_suffix(OVERFLOW_MARKER) {
            Some(head) => {
                let extra = entry
                    .extra_name
                    .as_deref()
                    .ok_or(CipherError::MissingExtraName)?;
                format!("{}{}", head, extra)
            }
            None => file.to_string(),
        };
        let (entry_type, sealed) = self.open_name(&full_name)?;

        let mut out = entry.clone();
        out.entry_type = Some(entry_type);
        out.id = Some(sealed.i);
        out.ts = Some(sealed.t);
        out.name = Some(sealed.n);
        Ok(out)
    }
}

/// Blob body for an encrypted entry
pub fn pack_body(entry: &Entry) -> Result<String, CipherError> {
    let content = entry
        .encrypted_content
        .as_deref()
        .ok_or(CipherError::MissingFields("encrypted_content"))?;
    Ok(match &entry.extra_name {
        Some(extra) => format!("{}{}{}", content, BODY_DELIMITER, extra),
        None => content.to_string(),
    })
}

/// Split a blob body into sealed content and optional extra name
pub fn unpack_body(body: &str) -> (&str, Option<&str>) {
    match body.split_once(BODY_DELIMITER) {
        Some((content, extra)) => (content, Some(extra)),
        None => (body, None),
    }
}

pub fn is_overflowing(file: &str) -> bool {
    file.ends_with(OVERFLOW_MARKER)
}

/// Draw 4-character base58 ids until `taken` rejects none
pub fn random_id<F>(taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    loop {
        let id = random_string(4);
        if !taken(&id) {
            return id;
        }
    }
}

/// Random base58 string, used as the plaintext name of snapshots
pub fn random_string(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| BASE58_ALPHABET[rng.random_range(0..BASE58_ALPHABET.len())] as char)
        .collect()
}
