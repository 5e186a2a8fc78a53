//! Vault hierarchy and its on-disk reconciliation
//!
//! - **[`Node`]** / **[`NodeGraph`]**: folders and secrets with their version history
//! - **[`CompressedNode`]**: the prefix-compressed index snapshot
//! - **[`Tree`]**: load, reconcile, add/update/remove, save
//! - **[`Alert`]** / **[`OrphanResolver`]**: recovery log and orphan-merge policy
//! - **[`TagIndex`]**: tag to node ids
//!
//! # On-disk model
//!
//! ```text
//! data/
//!   1<sealed>   DIR version      \
//!   2<sealed>   FILE version      } secrets, one blob per node-version
//!   2<sealed>~  FILE version     /  (name overflow, tail in the body)
//!   0<sealed>   index snapshot
//!   5<sealed>   tag snapshot
//! ```
//!
//! Blobs are immutable. The hierarchy exists only in the newest index
//! snapshot, which is rewritten after every mutation. Anything on disk the
//! snapshot does not reference is an orphan and gets reattached on load.

pub mod index;
mod node;
mod recovery;
mod tags;
mod tree_inner;

pub use index::{min_prefix_size, CompressedNode, Deserialized, IndexError, PrefixTable};
pub use node::{MoveUndo, Node, NodeError, NodeGraph, Version};
pub use recovery::{
    suffixed_name, Alert, AlertKind, AlwaysAppend, ForkOnDivergence, OrphanConflict,
    OrphanResolver, Resolution, SkipIdentical,
};
pub use tags::{validate_tag_name, TagError, TagIndex};
pub use tree_inner::{Tree, TreeError, TreeStatus};
