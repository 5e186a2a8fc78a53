use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::crypto;
use crate::entry::{Entry, EntryType, Timestamp, ROOT_ID, TAGS_ID};

/**
 * Nodes
 * =====
 * A node is one folder or secret of the vault. It never holds content:
 *  each version only remembers the plaintext name and the filename of the
 *  blob that stores it, so the content is read back on demand.
 * Nodes live in a [`NodeGraph`] arena keyed by id. A directory's children
 *  are a set of ids and the parent is an advisory id used for walking paths,
 *  so the graph has no reference cycles.
 */

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("missing fields: {0}")]
    MissingFields(&'static str),
    #[error("unsupported type: {0}")]
    UnsupportedType(EntryType),
    #[error("version not found: {0}")]
    VersionNotFound(Timestamp),
    #[error("path does not exist: {0}")]
    PathNotFound(String),
    #[error("entry exists: {0}")]
    EntryExists(String),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("id mismatch, expected {expected}, got {found}")]
    IdMismatch { expected: String, found: String },
    #[error("duplicate id: {0}")]
    DuplicateId(String),
    #[error("cannot move '{from}' into its own descendant '{to}'")]
    MoveIntoSelf { from: String, to: String },
    #[error("the root cannot be changed")]
    RootImmutable,
}

/// One immutable version of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub name: String,
    /// Encrypted filename of the blob, as stored on disk
    pub file: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    id: String,
    node_type: EntryType,
    versions: BTreeMap<Timestamp, Version>,
    children: BTreeSet<String>,
    parent: Option<String>,
}

impl Node {
    pub fn root() -> Self {
        Self {
            id: ROOT_ID.to_string(),
            node_type: EntryType::Root,
            versions: BTreeMap::new(),
            children: BTreeSet::new(),
            parent: None,
        }
    }

    /// Build a node from the first version of an entry.
    ///
    /// Non-root entries must carry id, ts, name and encrypted name.
    pub fn from_entry(entry: &Entry) -> Result<Self, NodeError> {
        let node_type = entry.entry_type.ok_or(NodeError::MissingFields("type"))?;
        match node_type {
            EntryType::Root => return Ok(Self::root()),
            EntryType::Tags => return Err(NodeError::UnsupportedType(node_type)),
            EntryType::Dir | EntryType::File => {}
        }
        let id = entry.id.clone().ok_or(NodeError::MissingFields("id"))?;
        let ts = entry.ts.ok_or(NodeError::MissingFields("ts"))?;
        let name = entry
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or(NodeError::MissingFields("name"))?;
        let file = entry
            .encrypted_name
            .clone()
            .ok_or(NodeError::MissingFields("encrypted_name"))?;

        let mut versions = BTreeMap::new();
        versions.insert(ts, Version { name, file });
        Ok(Self {
            id,
            node_type,
            versions,
            children: BTreeSet::new(),
            parent: entry.parent.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn node_type(&self) -> EntryType {
        self.node_type
    }

    pub fn is_root(&self) -> bool {
        self.node_type == EntryType::Root
    }

    /// Root and directories can hold children
    pub fn is_dir(&self) -> bool {
        matches!(self.node_type, EntryType::Root | EntryType::Dir)
    }

    pub fn is_file(&self) -> bool {
        self.node_type == EntryType::File
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn children(&self) -> &BTreeSet<String> {
        &self.children
    }

    pub fn versions(&self) -> &BTreeMap<Timestamp, Version> {
        &self.versions
    }

    pub fn version_timestamps(&self) -> Vec<Timestamp> {
        self.versions.keys().copied().collect()
    }

    /// Timestamp of the current version
    pub fn last_ts(&self) -> Option<Timestamp> {
        self.versions.keys().next_back().copied()
    }

    fn version(&self, ts: Option<Timestamp>) -> Result<&Version, NodeError> {
        match ts {
            Some(ts) => self.versions.get(&ts).ok_or(NodeError::VersionNotFound(ts)),
            None => self
                .versions
                .values()
                .next_back()
                .ok_or(NodeError::MissingFields("versions")),
        }
    }

    /// Name of a version, the current one by default. The root is nameless.
    pub fn get_name(&self, ts: Option<Timestamp>) -> Result<&str, NodeError> {
        if self.is_root() && ts.is_none() {
            return Ok("");
        }
        Ok(&self.version(ts)?.name)
    }

    /// Encrypted filename of a version, the current one by default
    pub fn get_file(&self, ts: Option<Timestamp>) -> Result<&str, NodeError> {
        Ok(&self.version(ts)?.file)
    }

    /// Append a version; an existing timestamp is never rewritten
    pub fn append_version(&mut self, ts: Timestamp, version: Version) -> bool {
        if self.versions.contains_key(&ts) {
            return false;
        }
        self.versions.insert(ts, version);
        true
    }

    pub(crate) fn remove_version(&mut self, ts: Timestamp) -> Option<Version> {
        self.versions.remove(&ts)
    }
}

/// Record of a [`NodeGraph::move_node`] so it can be reverted
#[derive(Debug, Clone, PartialEq)]
pub struct MoveUndo {
    pub id: String,
    pub appended: Option<Timestamp>,
    pub previous_parent: Option<String>,
}

/// Arena holding every node of a tree, rooted at [`ROOT_ID`]
#[derive(Debug, Clone, PartialEq)]
pub struct NodeGraph {
    nodes: HashMap<String, Node>,
}

impl Default for NodeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeGraph {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID.to_string(), Node::root());
        Self { nodes }
    }

    pub fn root(&self) -> &Node {
        // the root is inserted at construction and never detached
        &self.nodes[ROOT_ID]
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn node(&self, id: &str) -> Result<&Node, NodeError> {
        self.get(id)
            .ok_or_else(|| NodeError::NodeNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Fresh id, unused in this graph and distinct from the reserved ids
    pub fn random_id(&self) -> String {
        crypto::random_id(|id| self.contains(id) || id == TAGS_ID)
    }

    /// Attach a new node under `parent`, enforcing unique current names
    pub fn add(&mut self, parent: &str, node: Node) -> Result<(), NodeError> {
        let name = node.get_name(None)?.to_string();
        if let Some(existing) = self.find_child_by_name(parent, &name) {
            let path = self.path_of(existing)?;
            return Err(NodeError::EntryExists(path));
        }
        self.insert_child(parent, node)
    }

    /// Attach without the name check, used when rebuilding from an index
    pub(crate) fn insert_child(&mut self, parent: &str, mut node: Node) -> Result<(), NodeError> {
        if self.contains(node.id()) {
            return Err(NodeError::DuplicateId(node.id().to_string()));
        }
        let target = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| NodeError::NodeNotFound(parent.to_string()))?;
        if !target.is_dir() {
            return Err(NodeError::NotADirectory(parent.to_string()));
        }
        target.children.insert(node.id.clone());
        node.parent = Some(parent.to_string());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node and its whole subtree from the arena.
    ///
    /// The detached nodes are returned, the node itself first, so they can be
    ///  restored or their blobs collected.
    pub fn detach(&mut self, id: &str) -> Result<Vec<Node>, NodeError> {
        let node = self.node(id)?;
        if node.is_root() {
            return Err(NodeError::RootImmutable);
        }
        if let Some(parent) = node.parent.clone() {
            if let Some(parent) = self.nodes.get_mut(&parent) {
                parent.children.remove(id);
            }
        }

        let mut removed = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                stack.extend(node.children.iter().cloned());
                removed.push(node);
            }
        }
        Ok(removed)
    }

    /// Put back nodes returned by [`NodeGraph::detach`]
    pub(crate) fn restore(&mut self, nodes: Vec<Node>) {
        let mut nodes = nodes.into_iter();
        let Some(top) = nodes.next() else {
            return;
        };
        if let Some(parent) = top.parent.as_deref().and_then(|p| self.nodes.get_mut(p)) {
            parent.children.insert(top.id.clone());
        }
        self.nodes.insert(top.id.clone(), top);
        for node in nodes {
            self.nodes.insert(node.id.clone(), node);
        }
    }

    /// Apply an updated entry to the node it identifies.
    ///
    /// A new `ts` appends `{name, encrypted_name}` as the current version.
    ///  A different `parent` moves the node under that directory.
    pub fn move_node(&mut self, id: &str, entry: &Entry) -> Result<MoveUndo, NodeError> {
        let node = self.node(id)?;
        if node.is_root() {
            return Err(NodeError::RootImmutable);
        }
        let found = entry.id.clone().unwrap_or_default();
        if found != id {
            return Err(NodeError::IdMismatch {
                expected: id.to_string(),
                found,
            });
        }

        let current_parent = node.parent.clone().unwrap_or_else(|| ROOT_ID.to_string());
        let target_parent = entry.parent.clone().unwrap_or_else(|| current_parent.clone());
        let new_name = match &entry.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => node.get_name(None)?.to_string(),
        };
        let new_version = match entry.ts {
            Some(ts) if !node.versions.contains_key(&ts) => {
                let file = entry
                    .encrypted_name
                    .clone()
                    .ok_or(NodeError::MissingFields("encrypted_name"))?;
                Some((
                    ts,
                    Version {
                        name: new_name.clone(),
                        file,
                    },
                ))
            }
            _ => None,
        };

        // validate everything before touching the graph
        let target = self.node(&target_parent)?;
        if !target.is_dir() {
            return Err(NodeError::NotADirectory(self.path_of(&target_parent)?));
        }
        if target_parent != current_parent && self.is_ancestor(id, &target_parent) {
            return Err(NodeError::MoveIntoSelf {
                from: self.path_of(id)?,
                to: self.path_of(&target_parent)?,
            });
        }
        if let Some(existing) = self.find_child_by_name(&target_parent, &new_name) {
            if existing != id {
                return Err(NodeError::EntryExists(self.path_of(existing)?));
            }
        }

        let mut undo = MoveUndo {
            id: id.to_string(),
            appended: None,
            previous_parent: None,
        };
        if let Some((ts, version)) = new_version {
            if let Some(node) = self.nodes.get_mut(id) {
                node.append_version(ts, version);
                undo.appended = Some(ts);
            }
        }
        if target_parent != current_parent {
            self.reparent(id, &current_parent, &target_parent);
            undo.previous_parent = Some(current_parent);
        }
        Ok(undo)
    }

    /// Revert a successful [`NodeGraph::move_node`]
    pub(crate) fn undo_move(&mut self, undo: MoveUndo) {
        if let Some(previous) = undo.previous_parent {
            let current = self
                .get(&undo.id)
                .and_then(|n| n.parent.clone())
                .unwrap_or_else(|| ROOT_ID.to_string());
            self.reparent(&undo.id, &current, &previous);
        }
        if let (Some(ts), Some(node)) = (undo.appended, self.nodes.get_mut(&undo.id)) {
            node.remove_version(ts);
        }
    }

    fn reparent(&mut self, id: &str, from: &str, to: &str) {
        if let Some(old) = self.nodes.get_mut(from) {
            old.children.remove(id);
        }
        if let Some(new) = self.nodes.get_mut(to) {
            new.children.insert(id.to_string());
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent = Some(to.to_string());
        }
    }

    /// Whether `ancestor` is `id` itself or one of its ancestors
    pub fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.get(current).and_then(|n| n.parent());
        }
        false
    }

    /// Child of `parent` whose current name is `name`
    pub fn find_child_by_name(&self, parent: &str, name: &str) -> Option<&str> {
        let parent = self.get(parent)?;
        parent
            .children
            .iter()
            .filter_map(|id| self.get(id))
            .find(|child| child.get_name(None).map(|n| n == name).unwrap_or(false))
            .map(|child| child.id())
    }

    /// Children of a node, sorted by current name
    pub fn children_sorted(&self, id: &str) -> Vec<&Node> {
        let mut children: Vec<&Node> = self
            .get(id)
            .map(|n| n.children.iter().filter_map(|c| self.get(c)).collect())
            .unwrap_or_default();
        children.sort_by(|a, b| a.get_name(None).ok().cmp(&b.get_name(None).ok()));
        children
    }

    /// Resolve a `/`-delimited path starting at `from`.
    ///
    /// `.` and empty segments stay put, `..` goes up (the root is its own
    ///  parent), `~` jumps to the root, as does a leading `/`.
    pub fn child_from_path(&self, from: &str, path: &str) -> Result<&str, NodeError> {
        let mut cursor = if path.starts_with('/') {
            ROOT_ID
        } else {
            self.node(from)?.id()
        };
        for segment in path.split('/') {
            cursor = match segment {
                "" | "." => cursor,
                ".." => self.get(cursor).and_then(|n| n.parent()).unwrap_or(ROOT_ID),
                "~" => ROOT_ID,
                name => self
                    .find_child_by_name(cursor, name)
                    .ok_or_else(|| NodeError::PathNotFound(path.to_string()))?,
            };
        }
        Ok(cursor)
    }

    /// Deepest existing node along an absolute path, plus the segments left.
    ///
    /// Fails with `EntryExists` when the whole path already resolves.
    pub fn closest_ancestor(&self, path: &str) -> Result<(&str, Vec<String>), NodeError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut cursor = ROOT_ID;
        for (i, segment) in segments.iter().enumerate() {
            match self.find_child_by_name(cursor, segment) {
                Some(child) => cursor = child,
                None => {
                    let rest = segments[i..].iter().map(|s| s.to_string()).collect();
                    return Ok((cursor, rest));
                }
            }
        }
        Err(NodeError::EntryExists(path.to_string()))
    }

    /// Absolute path of a node from its current names
    pub fn path_of(&self, id: &str) -> Result<String, NodeError> {
        let mut segments = Vec::new();
        let mut cursor = self.node(id)?;
        while !cursor.is_root() {
            segments.push(cursor.get_name(None)?.to_string());
            let parent = cursor.parent().unwrap_or(ROOT_ID);
            cursor = self.node(parent)?;
            if segments.len() > self.nodes.len() {
                return Err(NodeError::PathNotFound(id.to_string()));
            }
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    /// Every version filename referenced by the graph
    pub fn all_files(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .flat_map(|n| n.versions.values().map(|v| v.file.clone()))
            .collect()
    }

    /// Absolute path to id for every non-root node
    pub fn paths(&self) -> BTreeMap<String, String> {
        self.nodes
            .values()
            .filter(|n| !n.is_root())
            .filter_map(|n| Some((self.path_of(n.id()).ok()?, n.id().to_string())))
            .collect()
    }

    /// Distance from the root, the root being 0
    pub fn depth(&self, id: &str) -> usize {
        let mut depth = 0;
        let mut cursor = self.get(id).and_then(|n| n.parent());
        while let Some(parent) = cursor {
            depth += 1;
            if depth > self.nodes.len() {
                break;
            }
            cursor = self.get(parent).and_then(|n| n.parent());
        }
        depth
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn entry(t: EntryType, id: &str, secs: u64, name: &str) -> Entry {
        Entry {
            entry_type: Some(t),
            id: Some(id.to_string()),
            ts: Some(Timestamp::new(secs, 0)),
            name: Some(name.to_string()),
            encrypted_name: Some(format!("{}{}{}", t.digit(), id, secs)),
            ..Default::default()
        }
    }

    /// /A (dir aaaa) containing /A/B (file bbbb), plus /C (dir cccc)
    pub(crate) fn sample() -> NodeGraph {
        let mut graph = NodeGraph::new();
        graph
            .add(ROOT_ID, Node::from_entry(&entry(EntryType::Dir, "aaaa", 10, "A")).unwrap())
            .unwrap();
        graph
            .add("aaaa", Node::from_entry(&entry(EntryType::File, "bbbb", 11, "B")).unwrap())
            .unwrap();
        graph
            .add(ROOT_ID, Node::from_entry(&entry(EntryType::Dir, "cccc", 12, "C")).unwrap())
            .unwrap();
        graph
    }

    #[test]
    fn test_from_entry_validation() {
        assert_eq!(
            Node::from_entry(&Entry::new(EntryType::Tags)),
            Err(NodeError::UnsupportedType(EntryType::Tags))
        );
        assert_eq!(
            Node::from_entry(&Entry::new(EntryType::File).with_id("abcd")),
            Err(NodeError::MissingFields("ts"))
        );
        let root = Node::from_entry(&Entry::new(EntryType::Root)).unwrap();
        assert_eq!(root.id(), ROOT_ID);
        assert!(root.versions().is_empty());
    }

    #[test]
    fn test_get_name_and_file() {
        let node = Node::from_entry(&entry(EntryType::File, "bbbb", 11, "B")).unwrap();
        assert_eq!(node.get_name(None).unwrap(), "B");
        assert_eq!(node.get_file(Some(Timestamp::new(11, 0))).unwrap(), "2bbbb11");
        assert_eq!(
            node.get_name(Some(Timestamp::new(99, 0))),
            Err(NodeError::VersionNotFound(Timestamp::new(99, 0)))
        );
    }

    #[test]
    fn test_child_from_path() {
        let graph = sample();
        assert_eq!(graph.child_from_path(ROOT_ID, "A/B").unwrap(), "bbbb");
        assert_eq!(graph.child_from_path("bbbb", "../../C").unwrap(), "cccc");
        assert_eq!(graph.child_from_path("aaaa", "./B").unwrap(), "bbbb");
        assert_eq!(graph.child_from_path("aaaa", "~/C").unwrap(), "cccc");
        assert_eq!(graph.child_from_path("aaaa", "..//../..").unwrap(), ROOT_ID);
        assert_eq!(
            graph.child_from_path(ROOT_ID, "A/nope"),
            Err(NodeError::PathNotFound("A/nope".to_string()))
        );
    }

    #[test]
    fn test_add_rejects_file_parent_and_duplicate_name() {
        let mut graph = sample();
        let child = Node::from_entry(&entry(EntryType::File, "dddd", 13, "x")).unwrap();
        assert_eq!(
            graph.add("bbbb", child),
            Err(NodeError::NotADirectory("bbbb".to_string()))
        );
        let dup = Node::from_entry(&entry(EntryType::File, "eeee", 14, "B")).unwrap();
        assert_eq!(
            graph.add("aaaa", dup),
            Err(NodeError::EntryExists("/A/B".to_string()))
        );
    }

    #[test]
    fn test_closest_ancestor() {
        let graph = sample();
        let (id, rest) = graph.closest_ancestor("/A/x/y").unwrap();
        assert_eq!(id, "aaaa");
        assert_eq!(rest, vec!["x", "y"]);
        assert_eq!(
            graph.closest_ancestor("/A/B"),
            Err(NodeError::EntryExists("/A/B".to_string()))
        );
    }

    #[test]
    fn test_rename_appends_one_version() {
        let mut graph = sample();
        let mut rename = entry(EntryType::File, "bbbb", 20, "B2");
        rename.parent = None;
        let undo = graph.move_node("bbbb", &rename).unwrap();
        let node = graph.get("bbbb").unwrap();
        assert_eq!(node.versions().len(), 2);
        assert_eq!(node.get_name(None).unwrap(), "B2");
        assert_eq!(node.get_name(Some(Timestamp::new(11, 0))).unwrap(), "B");
        assert_eq!(graph.path_of("bbbb").unwrap(), "/A/B2");

        graph.undo_move(undo);
        assert_eq!(graph, sample());
    }

    #[test]
    fn test_reparent_keeps_history() {
        let mut graph = sample();
        let moved = Entry::new(EntryType::File)
            .with_id("bbbb")
            .with_parent("cccc");
        let undo = graph.move_node("bbbb", &moved).unwrap();
        assert_eq!(graph.path_of("bbbb").unwrap(), "/C/B");
        assert_eq!(graph.get("bbbb").unwrap().versions().len(), 1);
        assert!(graph.get("aaaa").unwrap().children().is_empty());

        graph.undo_move(undo);
        assert_eq!(graph, sample());
    }

    #[test]
    fn test_move_checks() {
        let mut graph = sample();
        let wrong = Entry::new(EntryType::File).with_id("zzzz");
        assert!(matches!(
            graph.move_node("bbbb", &wrong),
            Err(NodeError::IdMismatch { .. })
        ));
        let into_self = Entry::new(EntryType::Dir).with_id("aaaa").with_parent("aaaa");
        assert!(matches!(
            graph.move_node("aaaa", &into_self),
            Err(NodeError::MoveIntoSelf { .. })
        ));
        let into_file = Entry::new(EntryType::Dir).with_id("cccc").with_parent("bbbb");
        assert!(matches!(
            graph.move_node("cccc", &into_file),
            Err(NodeError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_detach_and_restore() {
        let mut graph = sample();
        let removed = graph.detach("aaaa").unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].id(), "aaaa");
        assert!(!graph.contains("bbbb"));
        assert_eq!(graph.detach(ROOT_ID), Err(NodeError::RootImmutable));

        graph.restore(removed);
        assert_eq!(graph, sample());
    }

    #[test]
    fn test_paths_and_depth() {
        let graph = sample();
        let paths = graph.paths();
        assert_eq!(paths.get("/A/B").map(String::as_str), Some("bbbb"));
        assert_eq!(paths.len(), 3);
        assert_eq!(graph.depth("bbbb"), 2);
        assert_eq!(graph.depth(ROOT_ID), 0);
        assert_eq!(graph.all_files().len(), 3);
    }
}
