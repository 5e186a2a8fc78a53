//! Compressed index snapshots
//!
//! Every version filename already exists on disk, so a snapshot only stores
//! the shortest prefix that tells the tree's filenames apart. Rebuilding the
//! graph needs the real filename list to expand the prefixes again.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::node::{Node, NodeError, NodeGraph, Version};
use crate::entry::{Entry, Timestamp, ROOT_ID};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("malformed index snapshot: {0}")]
    Json(#[from] serde_json::Error),
    #[error("node error: {0}")]
    Node(#[from] NodeError),
}

/// Serialized form of one node: version prefixes plus children
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompressedNode {
    /// Prefix length, only present on the root
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<usize>,
    #[serde(rename = "v", default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<String>,
    #[serde(rename = "c", default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<CompressedNode>,
}

impl CompressedNode {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

fn prefix(file: &str, size: usize) -> &str {
    match file.char_indices().nth(size) {
        Some((i, _)) => &file[..i],
        None => file,
    }
}

/// Smallest N such that truncating every filename to N chars keeps them unique
pub fn min_prefix_size<'a, I>(files: I) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    let files: BTreeSet<&str> = files.into_iter().collect();
    let longest = files.iter().map(|f| f.chars().count()).max().unwrap_or(1);
    let mut size = 1;
    while size < longest {
        let prefixes: HashSet<&str> = files.iter().map(|f| prefix(f, size)).collect();
        if prefixes.len() == files.len() {
            break;
        }
        size += 1;
    }
    size
}

/// Prefix to full filename table over the real on-disk filenames
#[derive(Debug, Default)]
pub struct PrefixTable {
    size: usize,
    table: HashMap<String, Vec<String>>,
}

impl PrefixTable {
    pub fn new<'a, I>(size: usize, files: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut table: HashMap<String, Vec<String>> = HashMap::new();
        for file in files {
            table
                .entry(prefix(file, size).to_string())
                .or_default()
                .push(file.to_string());
        }
        Self { size, table }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn candidates(&self, prefix: &str) -> &[String] {
        self.table.get(prefix).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Serialize a graph.
///
/// `known_files` are secret filenames present on disk but not referenced by
///  the graph; they take part in sizing the prefixes so they can never alias
///  a referenced one.
pub fn serialize(graph: &NodeGraph, known_files: &BTreeSet<String>) -> CompressedNode {
    let files = graph.all_files();
    let size = min_prefix_size(files.iter().chain(known_files.iter()).map(String::as_str));
    let mut root = compress(graph, graph.root(), size);
    root.min_size = Some(size);
    root
}

fn compress(graph: &NodeGraph, node: &Node, size: usize) -> CompressedNode {
    CompressedNode {
        min_size: None,
        versions: node
            .versions()
            .values()
            .map(|v| prefix(&v.file, size).to_string())
            .collect(),
        children: node
            .children()
            .iter()
            .filter_map(|id| graph.get(id))
            .map(|child| compress(graph, child, size))
            .collect(),
    }
}

/// Result of rebuilding a graph from a snapshot
#[derive(Debug)]
pub struct Deserialized {
    pub graph: NodeGraph,
    /// Prefixes that matched no usable file on disk, with the path of the
    ///  directory they were listed under
    pub unresolved: Vec<(String, String)>,
}

/// Rebuild a graph from a snapshot.
///
/// `catalog` maps every on-disk secret filename to its decrypted entry
///  (type, id, ts, name). A prefix matching several files resolves to the
///  earliest one not newer than `not_after` that no other version claimed.
///  A node none of whose versions resolve is dropped with its subtree.
pub fn deserialize(
    index: &CompressedNode,
    catalog: &BTreeMap<String, Entry>,
    not_after: Option<Timestamp>,
) -> Result<Deserialized, NodeError> {
    let size = index.min_size.ok_or(NodeError::MissingFields("s"))?;
    let mut builder = Builder {
        table: PrefixTable::new(size, catalog.keys().map(String::as_str)),
        catalog,
        not_after,
        claimed: HashSet::new(),
        unresolved: Vec::new(),
        graph: NodeGraph::new(),
    };
    for child in &index.children {
        builder.build(child, ROOT_ID);
    }
    Ok(Deserialized {
        graph: builder.graph,
        unresolved: builder.unresolved,
    })
}

impl NodeGraph {
    /// Index snapshot JSON of this graph, see [`serialize`]
    pub fn to_json(&self, known_files: &BTreeSet<String>) -> Result<String, serde_json::Error> {
        serialize(self, known_files).to_json()
    }

    /// Rebuild a graph from index snapshot JSON, see [`deserialize`]
    pub fn from_json(
        json: &str,
        catalog: &BTreeMap<String, Entry>,
        not_after: Option<Timestamp>,
    ) -> Result<Deserialized, IndexError> {
        let compressed = CompressedNode::from_json(json)?;
        Ok(deserialize(&compressed, catalog, not_after)?)
    }
}

struct Builder<'a> {
    table: PrefixTable,
    catalog: &'a BTreeMap<String, Entry>,
    not_after: Option<Timestamp>,
    claimed: HashSet<String>,
    unresolved: Vec<(String, String)>,
    graph: NodeGraph,
}

impl Builder<'_> {
    fn resolve(&mut self, prefix: &str, id: Option<&str>) -> Option<(String, Entry)> {
        let best = self
            .table
            .candidates(prefix)
            .iter()
            .filter(|f| !self.claimed.contains(*f))
            .filter_map(|f| self.catalog.get(f).map(|e| (f, e)))
            .filter(|(_, e)| match (self.not_after, e.ts) {
                (Some(limit), Some(ts)) => ts <= limit,
                _ => true,
            })
            .filter(|(_, e)| id.is_none() || e.id.as_deref() == id)
            .min_by_key(|(_, e)| e.ts)
            .map(|(f, e)| (f.clone(), e.clone()));
        let (file, entry) = best?;
        self.claimed.insert(file.clone());
        Some((file, entry))
    }

    fn build(&mut self, compressed: &CompressedNode, parent: &str) {
        let mut versions: Vec<(String, Entry)> = Vec::new();
        let mut id: Option<String> = None;
        for prefix in &compressed.versions {
            match self.resolve(prefix, id.as_deref()) {
                Some((file, entry)) => {
                    id = id.or_else(|| entry.id.clone());
                    versions.push((file, entry));
                }
                None => {
                    tracing::warn!("index prefix {} matches no blob on disk", prefix);
                    let path = self.graph.path_of(parent).unwrap_or_default();
                    self.unresolved.push((path, prefix.clone()));
                }
            }
        }
        versions.sort_by_key(|(_, e)| e.ts);

        let mut versions = versions.into_iter();
        let Some((file, first)) = versions.next() else {
            tracing::warn!("dropping node with no resolvable version");
            return;
        };
        let first = Entry {
            encrypted_name: Some(file),
            ..first
        };
        let mut node = match Node::from_entry(&first) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!("dropping node from index: {}", e);
                return;
            }
        };
        for (file, entry) in versions {
            if let (Some(ts), Some(name)) = (entry.ts, entry.name) {
                node.append_version(ts, Version { name, file });
            }
        }

        let id = node.id().to_string();
        if let Err(e) = self.graph.insert_child(parent, node) {
            tracing::warn!("dropping node {} from index: {}", id, e);
            return;
        }
        for child in &compressed.children {
            self.build(child, &id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entry::EntryType;
    use crate::tree::node::test::{entry, sample};

    fn catalog_of(graph: &NodeGraph) -> BTreeMap<String, Entry> {
        let mut catalog = BTreeMap::new();
        for node in graph.nodes().filter(|n| !n.is_root()) {
            for (ts, v) in node.versions() {
                catalog.insert(
                    v.file.clone(),
                    Entry {
                        entry_type: Some(node.node_type()),
                        id: Some(node.id().to_string()),
                        ts: Some(*ts),
                        name: Some(v.name.clone()),
                        encrypted_name: Some(v.file.clone()),
                        ..Default::default()
                    },
                );
            }
        }
        catalog
    }

    #[test]
    fn test_min_prefix_size() {
        assert_eq!(min_prefix_size(["1abc", "2abc"]), 1);
        assert_eq!(min_prefix_size(["1abc", "1abd", "2xyz"]), 4);
        assert_eq!(min_prefix_size(["1ab", "1abc"]), 4);
        assert_eq!(min_prefix_size(Vec::<&str>::new()), 1);
    }

    #[test]
    fn test_round_trip() {
        let mut graph = sample();
        let rename = entry(EntryType::File, "bbbb", 30, "B renamed");
        graph.move_node("bbbb", &rename).unwrap();

        let compressed = serialize(&graph, &BTreeSet::new());
        let json = compressed.to_json().unwrap();
        assert!(!json.contains("B renamed"));

        let parsed = CompressedNode::from_json(&json).unwrap();
        let rebuilt = deserialize(&parsed, &catalog_of(&graph), None).unwrap();
        assert!(rebuilt.unresolved.is_empty());
        assert_eq!(rebuilt.graph, graph);
    }

    #[test]
    fn test_graph_json_round_trip() {
        let graph = sample();
        let json = graph.to_json(&BTreeSet::new()).unwrap();
        let rebuilt = NodeGraph::from_json(&json, &catalog_of(&graph), None).unwrap();
        assert_eq!(rebuilt.graph, graph);
        assert!(matches!(
            NodeGraph::from_json("{\"v\": 3}", &BTreeMap::new(), None),
            Err(IndexError::Json(_))
        ));
    }

    #[test]
    fn test_later_blob_does_not_steal_prefix() {
        let graph = sample();
        let compressed = serialize(&graph, &BTreeSet::new());
        let mut catalog = catalog_of(&graph);
        // a blob of /A/B written after the snapshot, sharing every prefix
        let late = entry(EntryType::File, "bbbb", 5, "B");
        let mut later = late.clone();
        later.ts = Some(Timestamp::new(100, 0));
        later.encrypted_name = Some("2bbbb100".to_string());
        catalog.insert("2bbbb100".to_string(), later);

        let rebuilt = deserialize(&compressed, &catalog, Some(Timestamp::new(50, 0))).unwrap();
        let b = rebuilt.graph.get("bbbb").unwrap();
        assert_eq!(b.versions().len(), 1);
        assert_eq!(b.get_file(None).unwrap(), "2bbbb11");
    }

    #[test]
    fn test_missing_blob_drops_subtree() {
        let graph = sample();
        let compressed = serialize(&graph, &BTreeSet::new());
        let mut catalog = catalog_of(&graph);
        catalog.remove("1aaaa10");

        let rebuilt = deserialize(&compressed, &catalog, None).unwrap();
        assert_eq!(rebuilt.unresolved.len(), 1);
        assert!(!rebuilt.graph.contains("aaaa"));
        assert!(!rebuilt.graph.contains("bbbb"));
        assert!(rebuilt.graph.contains("cccc"));
    }

    #[test]
    fn test_missing_size_is_an_error() {
        let compressed = CompressedNode::default();
        assert!(matches!(
            deserialize(&compressed, &BTreeMap::new(), None),
            Err(NodeError::MissingFields("s"))
        ));
    }
}
