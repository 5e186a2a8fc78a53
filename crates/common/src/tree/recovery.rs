//! Crash recovery records and orphan-merge policies
//!
//! Loading a dataset may find blobs the newest index does not reference.
//! Each one is reattached and reported as an [`Alert`]. When an orphan is a
//! version of a node the index still knows, an [`OrphanResolver`] decides
//! whether it becomes a new version, is dropped as a duplicate, or is split
//! off as a sibling.
//!
//! # Built-in Strategies
//!
//! - **[`SkipIdentical`]**: drop exact duplicates, append anything else (default)
//! - **[`AlwaysAppend`]**: append every orphan as a version
//! - **[`ForkOnDivergence`]**: drop exact duplicates, fork divergent content
//!   into a sibling node

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entry::Timestamp;

/// What a load did about one piece of damage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// No index snapshot at all, the node was attached under the root
    IndexLost,
    /// Orphan appended as a new version of a node the index knows
    Merged,
    /// Orphan identical to the current version, its blob was deleted
    Duplicate,
    /// Orphan placed back under its last known ancestor
    Restored,
    /// Orphan without any history, attached under the root
    Recovered,
    /// Divergent orphan split off into a new sibling node
    Forked,
    /// The index references a blob that is gone
    MissingBlob,
    /// Orphaned blob whose body does not decrypt, left in place
    Unreadable,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertKind::IndexLost => "index lost",
            AlertKind::Merged => "merged",
            AlertKind::Duplicate => "duplicate",
            AlertKind::Restored => "restored",
            AlertKind::Recovered => "recovered",
            AlertKind::Forked => "forked",
            AlertKind::MissingBlob => "missing blob",
            AlertKind::Unreadable => "unreadable",
        };
        write!(f, "{}", s)
    }
}

/// One entry of the recovery log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    /// Final path of the affected node
    pub path: String,
    pub id: Option<String>,
}

impl Alert {
    pub fn new(kind: AlertKind, path: impl Into<String>, id: Option<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            id,
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.path)
    }
}

/// An orphaned version of a node still present in the tree
#[derive(Debug, Clone)]
pub struct OrphanConflict {
    pub path: String,
    pub current_ts: Timestamp,
    pub current_name: String,
    pub current_content: String,
    pub orphan_ts: Timestamp,
    pub orphan_name: String,
    pub orphan_content: String,
}

impl OrphanConflict {
    /// Same name and same content as the current version
    pub fn is_identical(&self) -> bool {
        self.current_name == self.orphan_name
            && crate::crypto::content_digest(&self.current_content)
                == crate::crypto::content_digest(&self.orphan_content)
    }
}

/// Resolution decision for an orphaned version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Append as a new version of the existing node
    AppendVersion,
    /// Drop the orphan and delete its blob
    Discard,
    /// Attach as a new sibling node with a suffixed name
    Fork,
}

/// Strategy deciding what to do with an orphaned version
pub trait OrphanResolver: fmt::Debug + Send + Sync {
    fn resolve(&self, conflict: &OrphanConflict) -> Resolution;
}

#[derive(Debug, Clone, Default)]
pub struct SkipIdentical;

impl OrphanResolver for SkipIdentical {
    fn resolve(&self, conflict: &OrphanConflict) -> Resolution {
        if conflict.is_identical() {
            Resolution::Discard
        } else {
            Resolution::AppendVersion
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlwaysAppend;

impl OrphanResolver for AlwaysAppend {
    fn resolve(&self, _conflict: &OrphanConflict) -> Resolution {
        Resolution::AppendVersion
    }
}

#[derive(Debug, Clone, Default)]
pub struct ForkOnDivergence;

impl OrphanResolver for ForkOnDivergence {
    fn resolve(&self, conflict: &OrphanConflict) -> Resolution {
        if conflict.is_identical() {
            Resolution::Discard
        } else {
            Resolution::Fork
        }
    }
}

/// Deterministic free name: `name`, then `name.2`, `name.3`, ...
pub fn suffixed_name<F>(name: &str, taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    if !taken(name) {
        return name.to_string();
    }
    (2..)
        .map(|n| format!("{}.{}", name, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| name.to_string())
}
