//! Path-oriented façade over a [`Tree`]
//!
//! Turns shell-style paths (`~/a/../b`, relative to the working folder) into
//! tree mutations: make, change (rename, move, rewrite), remove and
//! completion.

use std::sync::Arc;

use regex::Regex;

use crate::config::VaultConfig;
use crate::crypto::{EntryCipher, MAX_FILENAME_LENGTH};
use crate::entry::{Entry, EntryType, Timestamp, ROOT_ID};
use crate::tree::{NodeError, Tree, TreeError};

/// Characters that never survive into a node name
pub const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '\\', '|', '?', '*'];

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
    #[error("node error: {0}")]
    Node(#[from] NodeError),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("name longer than {max} characters: {name}")]
    NameTooLong { name: String, max: usize },
    #[error("cannot move a node to a folder that does not exist: {0}")]
    MissingFolder(String),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone)]
pub struct MakeOptions {
    pub path: String,
    pub entry_type: EntryType,
    pub content: Option<String>,
}

impl MakeOptions {
    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            entry_type: EntryType::Dir,
            content: None,
        }
    }

    pub fn file(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            entry_type: EntryType::File,
            content: Some(content.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeOptions {
    pub path: String,
    pub new_path: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    pub path: String,
    pub version: Option<Timestamp>,
}

#[derive(Debug)]
pub struct InternalFs {
    tree: Tree,
    max_name_length: usize,
}

impl InternalFs {
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            max_name_length: MAX_FILENAME_LENGTH,
        }
    }

    pub fn from_config(config: &VaultConfig, cipher: Arc<dyn EntryCipher>) -> Self {
        Self {
            tree: Tree::from_config(config, cipher),
            max_name_length: config.max_name_length,
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    /// Load the tree, repairing the dataset if needed
    pub async fn init(&mut self) -> Result<(), FsError> {
        self.tree.load().await?;
        Ok(())
    }

    /// Absolute, sanitized form of `path`.
    ///
    /// A leading `~` is the root, other `~` are dropped; relative paths are
    ///  resolved against the working folder.
    pub fn normalize_path(&self, path: &str) -> Result<String, FsError> {
        if path.is_empty() {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        let trimmed = path.trim_start_matches('~');
        let path = if trimmed.len() != path.len() {
            format!("/{}", trimmed.replace('~', ""))
        } else {
            path.replace('~', "")
        };
        let absolute = if path.starts_with('/') {
            path.clone()
        } else {
            format!("{}/{}", self.pwd()?, path)
        };

        let mut segments: Vec<String> = Vec::new();
        for segment in absolute.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                segment => {
                    let clean: String = segment
                        .chars()
                        .filter(|c| !FORBIDDEN_CHARS.contains(c))
                        .collect();
                    if clean.chars().count() > self.max_name_length {
                        return Err(FsError::NameTooLong {
                            name: clean,
                            max: self.max_name_length,
                        });
                    }
                    if clean.is_empty() {
                        return Err(FsError::InvalidPath(path.to_string()));
                    }
                    segments.push(clean);
                }
            }
        }
        Ok(format!("/{}", segments.join("/")))
    }

    fn resolve(&self, path: &str) -> Result<String, FsError> {
        let normalized = self.normalize_path(path)?;
        Ok(self
            .tree
            .graph()
            .child_from_path(ROOT_ID, &normalized)?
            .to_string())
    }

    /// Create a folder or file, with any missing folders on the way.
    ///
    /// Fails if the full path already exists. Returns the id of the last node.
    pub async fn make(&mut self, options: MakeOptions) -> Result<String, FsError> {
        let path = self.normalize_path(&options.path)?;
        let (ancestor, remaining) = self.tree.graph().closest_ancestor(&path)?;
        let mut parent = ancestor.to_string();
        let last = remaining.len() - 1;
        for (i, name) in remaining.into_iter().enumerate() {
            let entry = if i < last {
                Entry::new(EntryType::Dir).with_name(name)
            } else {
                let mut entry = Entry::new(options.entry_type).with_name(name);
                if options.entry_type == EntryType::File {
                    entry.content = options.content.clone();
                }
                entry
            };
            parent = self.tree.add(&parent, entry).await?;
        }
        tracing::debug!("made {}", path);
        Ok(parent)
    }

    /// Rename, move or rewrite the node at `path`.
    ///
    /// `new_path` may be an existing folder (move, keeping the name) or a
    ///  missing path whose parent exists (move and/or rename).
    pub async fn change(&mut self, options: ChangeOptions) -> Result<String, FsError> {
        let path = self.normalize_path(&options.path)?;
        let graph = self.tree.graph();
        let id = graph.child_from_path(ROOT_ID, &path)?.to_string();
        let current_parent = graph
            .node(&id)?
            .parent()
            .unwrap_or(ROOT_ID)
            .to_string();

        let mut entry = Entry {
            content: options.content,
            ..Default::default()
        };
        let destination = match &options.new_path {
            Some(new_path) => Some(self.normalize_path(new_path)?),
            None => None,
        };
        if let Some(destination) = destination.filter(|d| *d != path) {
            match graph.child_from_path(ROOT_ID, &destination) {
                Ok(existing) => {
                    if !graph.node(existing)?.is_dir() {
                        return Err(NodeError::EntryExists(destination).into());
                    }
                    if existing != current_parent {
                        entry.parent = Some(existing.to_string());
                    }
                }
                Err(_) => {
                    let (ancestor, remaining) = graph.closest_ancestor(&destination)?;
                    if remaining.len() > 1 {
                        return Err(FsError::MissingFolder(destination));
                    }
                    if !graph.node(ancestor)?.is_dir() {
                        return Err(NodeError::NotADirectory(destination).into());
                    }
                    entry.name = remaining.into_iter().next();
                    if ancestor != current_parent {
                        entry.parent = Some(ancestor.to_string());
                    }
                }
            }
        }

        self.tree.update(&id, entry).await?;
        tracing::debug!("changed {}", path);
        Ok(id)
    }

    /// Remove the node at `path`, or only one of its versions
    pub async fn remove(&mut self, options: RemoveOptions) -> Result<Vec<String>, FsError> {
        let id = self.resolve(&options.path)?;
        let removed = self.tree.remove(&id, options.version).await?;
        if !self.tree.graph().contains(self.tree.working_node()) {
            self.tree.set_working_node(ROOT_ID)?;
        }
        Ok(removed)
    }

    /// Candidates for completing `path`.
    ///
    /// A folder lists its children (folders end with `/`). Otherwise the last
    ///  segment filters the parent's children, as a `*`/`?` wildcard pattern
    ///  if it has one, as a prefix if not.
    pub fn pseudo_file_completion(&self, path: Option<&str>) -> Result<Vec<String>, FsError> {
        let graph = self.tree.graph();
        let path = path.unwrap_or(".");
        let label = |id: &str| -> Option<String> {
            let node = graph.get(id)?;
            let name = node.get_name(None).ok()?;
            Some(if node.is_dir() {
                format!("{}/", name)
            } else {
                name.to_string()
            })
        };

        let has_wildcard = path.contains('*') || path.contains('?');
        if !has_wildcard {
            let normalized = self.normalize_path(path)?;
            if let Ok(id) = graph.child_from_path(ROOT_ID, &normalized) {
                let node = graph.node(id)?;
                if !node.is_dir() {
                    return Ok(label(id).into_iter().collect());
                }
                return Ok(graph
                    .children_sorted(id)
                    .into_iter()
                    .filter_map(|c| label(c.id()))
                    .collect());
            }
        }

        let (dir, base) = match path.rsplit_once('/') {
            Some((dir, base)) => (if dir.is_empty() { "/" } else { dir }, base),
            None => (".", path),
        };
        let dir = self.normalize_path(dir)?;
        let parent = graph.child_from_path(ROOT_ID, &dir)?;
        let matcher = wildcard_regex(base)?;
        Ok(graph
            .children_sorted(parent)
            .into_iter()
            .filter(|c| c.get_name(None).is_ok_and(|n| matcher.is_match(n)))
            .filter_map(|c| label(c.id()))
            .collect())
    }

    pub fn cd(&mut self, path: &str) -> Result<String, FsError> {
        let id = self.resolve(path)?;
        self.tree.set_working_node(&id)?;
        self.pwd()
    }

    pub fn pwd(&self) -> Result<String, FsError> {
        Ok(self.tree.graph().path_of(self.tree.working_node())?)
    }

    /// Content of a file, the current version by default
    pub async fn cat(&self, path: &str, ts: Option<Timestamp>) -> Result<String, FsError> {
        let id = self.resolve(path)?;
        let node = self.tree.graph().node(&id)?;
        if node.is_dir() {
            return Err(FsError::InvalidPath(format!("{} is a folder", path)));
        }
        let entry = self.tree.get_entry_details(&id, ts).await?;
        Ok(entry.content.unwrap_or_default())
    }

    /// Version history of a node, oldest first
    pub fn versions(&self, path: &str) -> Result<Vec<(Timestamp, String)>, FsError> {
        let id = self.resolve(path)?;
        let node = self.tree.graph().node(&id)?;
        Ok(node
            .versions()
            .iter()
            .map(|(ts, v)| (*ts, v.name.clone()))
            .collect())
    }
}

/// Anchored regex for a `*`/`?` wildcard pattern, or a prefix match without one
fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    if pattern.contains('*') || pattern.contains('?') {
        expr.push('$');
    }
    Regex::new(&expr)
}
