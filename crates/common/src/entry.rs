//! Entries and timestamps
//!
//! An [`Entry`] carries one node-version across the crypto boundary: the
//! plaintext side (`name`, `content`) and the encrypted side
//! (`encrypted_name`, `encrypted_content`, `extra_name`). Entries are never
//! persisted directly; the cipher turns them into blob names and bodies.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Fixed id of the root node (and of every index snapshot blob)
pub const ROOT_ID: &str = "rOOt";
/// Fixed id of tag snapshot blobs
pub const TAGS_ID: &str = "tAgs";

/// Type of an entry, encoded as the first character of its blob name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryType {
    Root,
    Dir,
    File,
    Tags,
}

impl EntryType {
    pub fn digit(&self) -> char {
        match self {
            EntryType::Root => '0',
            EntryType::Dir => '1',
            EntryType::File => '2',
            EntryType::Tags => '5',
        }
    }

    pub fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(EntryType::Root),
            '1' => Some(EntryType::Dir),
            '2' => Some(EntryType::File),
            '5' => Some(EntryType::Tags),
            _ => None,
        }
    }

    /// Secrets are the node-versions of the hierarchy, as opposed to snapshots
    pub fn is_secret(&self) -> bool {
        matches!(self, EntryType::Dir | EntryType::File)
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryType::Root => "root",
            EntryType::Dir => "dir",
            EntryType::File => "file",
            EntryType::Tags => "tags",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid timestamp: {0}")]
pub struct TimestampError(String);

/// Version timestamp as a (seconds, microseconds) pair.
///
/// Ordering is by seconds then microseconds, never by insertion order.
/// Rendered as `"<secs>.<micros>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    secs: u64,
    micros: u32,
}

// last issued stamp, in microseconds since the epoch
static LAST_ISSUED: AtomicU64 = AtomicU64::new(0);

impl Timestamp {
    pub fn new(secs: u64, micros: u32) -> Self {
        Self {
            secs: secs + (micros / 1_000_000) as u64,
            micros: micros % 1_000_000,
        }
    }

    /// Current wall-clock time, strictly increasing within this process
    pub fn now() -> Self {
        let wall = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut last = LAST_ISSUED.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match LAST_ISSUED.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return Self::from_micros(next),
                Err(actual) => last = actual,
            }
        }
    }

    fn from_micros(total: u64) -> Self {
        Self {
            secs: total / 1_000_000,
            micros: (total % 1_000_000) as u32,
        }
    }

    pub fn secs(&self) -> u64 {
        self.secs
    }

    pub fn micros(&self) -> u32 {
        self.micros
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.secs, self.micros)
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (secs, micros) = match s.split_once('.') {
            Some((secs, micros)) => (secs, micros),
            None => (s, "0"),
        };
        let secs = secs.parse().map_err(|_| TimestampError(s.to_string()))?;
        let micros: u32 = micros.parse().map_err(|_| TimestampError(s.to_string()))?;
        if micros >= 1_000_000 {
            return Err(TimestampError(s.to_string()));
        }
        Ok(Self { secs, micros })
    }
}

/// Plain value object for one node-version.
///
/// Produced by decrypting a blob, or handed to the cipher to produce the
/// encrypted fields. `parent` is the id of the node the entry should live
/// under, when a mutation moves it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub entry_type: Option<EntryType>,
    pub id: Option<String>,
    pub ts: Option<Timestamp>,
    pub name: Option<String>,
    pub content: Option<String>,
    pub encrypted_name: Option<String>,
    pub encrypted_content: Option<String>,
    pub extra_name: Option<String>,
    pub parent: Option<String>,
}

impl Entry {
    pub fn new(entry_type: EntryType) -> Self {
        Self {
            entry_type: Some(entry_type),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn is_type(&self, entry_type: EntryType) -> bool {
        self.entry_type == Some(entry_type)
    }
}
