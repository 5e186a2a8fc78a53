use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::VaultConfig;
use crate::crypto::{is_overflowing, pack_body, random_string, unpack_body, CipherError, EntryCipher};
use crate::entry::{Entry, EntryType, Timestamp, ROOT_ID, TAGS_ID};
use crate::storage::{BlobStorage, FsStorage, StorageError};

use super::index::{Deserialized, IndexError};
use super::node::{Node, NodeError, NodeGraph, Version};
use super::recovery::{
    suffixed_name, Alert, AlertKind, OrphanConflict, OrphanResolver, Resolution, SkipIdentical,
};
use super::tags::{TagError, TagIndex};

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("node error: {0}")]
    Node(#[from] NodeError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("tag error: {0}")]
    Tag(#[from] TagError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid entry: {0}")]
    Validation(String),
    #[error("tree is not loaded")]
    NotLoaded,
    #[error("tree is broken, a corrective write failed during load")]
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeStatus {
    Unloaded,
    Loaded,
    Broken,
}

/// Blobs found in the dataset directory, by decrypted type
#[derive(Debug, Default)]
struct Listing {
    indexes: Vec<Entry>,
    tags: Vec<Entry>,
    /// filename -> decrypted name-side entry, for every secret version
    catalog: BTreeMap<String, Entry>,
}

/**
 * Tree
 * ====
 * Owns the node graph of one dataset and keeps it consistent with the blobs
 *  on disk. Every mutation follows the same discipline:
 *  1. encrypt and write the new blob, never overwriting
 *  2. apply the change to the graph
 *  3. write a fresh index snapshot, then delete the one this session wrote before
 * A failure after step 1 reverts the graph and deletes the new blob. A crash
 *  anywhere leaves blobs the next [`Tree::load`] reconciles.
 */
#[derive(Debug)]
pub struct Tree {
    cipher: Arc<dyn EntryCipher>,
    storage: Arc<dyn BlobStorage>,
    resolver: Arc<dyn OrphanResolver>,
    graph: NodeGraph,
    working_node: String,
    tags: TagIndex,
    alerts: Vec<Alert>,
    status: TreeStatus,
    // secret filenames known to be on disk
    disk: BTreeSet<String>,
    previous_index: Option<String>,
    previous_tags: Option<String>,
    save_enabled: bool,
}

impl Tree {
    pub fn new(cipher: Arc<dyn EntryCipher>, storage: Arc<dyn BlobStorage>) -> Self {
        Self {
            cipher,
            storage,
            resolver: Arc::new(SkipIdentical),
            graph: NodeGraph::new(),
            working_node: ROOT_ID.to_string(),
            tags: TagIndex::new(),
            alerts: Vec::new(),
            status: TreeStatus::Unloaded,
            disk: BTreeSet::new(),
            previous_index: None,
            previous_tags: None,
            save_enabled: true,
        }
    }

    /// Tree over the config's data directory, with its orphan policy
    pub fn from_config(config: &VaultConfig, cipher: Arc<dyn EntryCipher>) -> Self {
        let storage = Arc::new(FsStorage::new(&config.data_dir));
        Self::new(cipher, storage).with_resolver(config.orphan_policy.resolver())
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn OrphanResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /* Getters */

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn status(&self) -> TreeStatus {
        self.status
    }

    /// Recovery log of the last load
    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn tags(&self) -> &TagIndex {
        &self.tags
    }

    pub fn working_node(&self) -> &str {
        &self.working_node
    }

    /// Filename of the index snapshot currently on disk for this session
    pub fn index_file(&self) -> Option<&str> {
        self.previous_index.as_deref()
    }

    pub fn set_working_node(&mut self, id: &str) -> Result<(), TreeError> {
        let node = self.graph.node(id)?;
        if !node.is_dir() {
            return Err(NodeError::NotADirectory(self.graph.path_of(id)?).into());
        }
        self.working_node = id.to_string();
        Ok(())
    }

    pub fn disable_save(&mut self) {
        self.save_enabled = false;
    }

    pub fn enable_save(&mut self) {
        self.save_enabled = true;
    }

    fn ensure_loaded(&self) -> Result<(), TreeError> {
        match self.status {
            TreeStatus::Loaded => Ok(()),
            TreeStatus::Unloaded => Err(TreeError::NotLoaded),
            TreeStatus::Broken => Err(TreeError::Broken),
        }
    }

    /* Blob helpers */

    async fn read_entry(&self, file: &str) -> Result<Entry, TreeError> {
        let body = self.storage.read(file).await?;
        let stored = Entry {
            encrypted_name: Some(file.to_string()),
            encrypted_content: Some(body),
            ..Default::default()
        };
        Ok(self.cipher.decrypt_entry(&stored)?)
    }

    /// Encrypt and write a blob under a name that must be new
    async fn write_version(&self, entry: &Entry) -> Result<Entry, TreeError> {
        let encrypted = self.cipher.encrypt_entry(entry)?;
        let file = encrypted
            .encrypted_name
            .as_deref()
            .ok_or(CipherError::MissingFields("encrypted_name"))?;
        self.storage.write_new(file, &pack_body(&encrypted)?).await?;
        Ok(encrypted)
    }

    /// Best-effort delete, failures only logged
    async fn discard_blob(&mut self, file: &str) {
        if let Err(e) = self.storage.delete(file).await {
            tracing::warn!("failed to delete blob {}: {}", file, e);
        }
        self.disk.remove(file);
    }

    fn mark_broken<T>(&mut self, result: Result<T, TreeError>) -> Result<T, TreeError> {
        if let Err(e) = &result {
            tracing::error!("corrective write failed, tree is broken: {}", e);
            self.status = TreeStatus::Broken;
        }
        result
    }

    /* Load */

    /// Rebuild the graph from the dataset directory and repair crash damage.
    ///
    /// A no-op on a loaded tree. Fails only if a corrective write fails, in
    ///  which case the tree is left [`TreeStatus::Broken`].
    pub async fn load(&mut self) -> Result<(), TreeError> {
        if self.status == TreeStatus::Loaded {
            return Ok(());
        }
        self.graph = NodeGraph::new();
        self.working_node = ROOT_ID.to_string();
        self.tags = TagIndex::new();
        self.alerts.clear();
        self.previous_index = None;
        self.previous_tags = None;

        self.storage.ensure_dir().await?;
        let listing = self.classify().await?;
        self.disk = listing.catalog.keys().cloned().collect();
        tracing::debug!(
            "dataset holds {} secrets, {} indexes, {} tag snapshots",
            listing.catalog.len(),
            listing.indexes.len(),
            listing.tags.len()
        );

        if !listing.catalog.is_empty() {
            let mut indexes = listing.indexes.clone();
            indexes.sort_by(|a, b| b.ts.cmp(&a.ts));
            self.reconcile(&listing.catalog, indexes).await?;
        } else {
            let mut indexes = listing.indexes.clone();
            indexes.sort_by(|a, b| b.ts.cmp(&a.ts));
            let mut indexes = indexes.into_iter().filter_map(|e| e.encrypted_name);
            self.previous_index = indexes.next();
            for file in indexes {
                if let Err(e) = self.storage.delete(&file).await {
                    tracing::warn!("failed to delete superseded index {}: {}", file, e);
                }
            }
        }

        self.load_tags(listing.tags).await;
        self.status = TreeStatus::Loaded;
        Ok(())
    }

    async fn classify(&self) -> Result<Listing, TreeError> {
        let mut listing = Listing::default();
        for file in self.storage.list().await? {
            // never a vault blob
            if file.contains('.') {
                continue;
            }
            let mut stored = Entry {
                encrypted_name: Some(file.clone()),
                ..Default::default()
            };
            if is_overflowing(&file) {
                let body = self.storage.read(&file).await?;
                stored.extra_name = unpack_body(&body).1.map(str::to_string);
            }
            let entry = match self.cipher.decrypt_item(&stored) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping undecryptable blob {}: {}", file, e);
                    continue;
                }
            };
            match entry.entry_type {
                Some(EntryType::Root) => listing.indexes.push(entry),
                Some(EntryType::Tags) => listing.tags.push(entry),
                Some(EntryType::Dir) | Some(EntryType::File) => {
                    listing.catalog.insert(file, entry);
                }
                None => {}
            }
        }
        Ok(listing)
    }

    /// Rebuild one index snapshot against the on-disk catalog
    async fn read_index(
        &self,
        entry: &Entry,
        catalog: &BTreeMap<String, Entry>,
    ) -> Result<Deserialized, TreeError> {
        let file = entry
            .encrypted_name
            .as_deref()
            .ok_or(CipherError::MissingFields("encrypted_name"))?;
        let snapshot = self.read_entry(file).await?;
        let json = snapshot.content.unwrap_or_default();
        Ok(NodeGraph::from_json(&json, catalog, entry.ts)?)
    }

    /// `indexes` are sorted newest first
    async fn reconcile(
        &mut self,
        catalog: &BTreeMap<String, Entry>,
        indexes: Vec<Entry>,
    ) -> Result<(), TreeError> {
        let mut newest: Option<(Entry, Deserialized)> = None;
        let mut history: Vec<NodeGraph> = Vec::new();
        let mut superseded: Vec<String> = Vec::new();
        for entry in &indexes {
            let deserialized = match self.read_index(entry, catalog).await {
                Ok(deserialized) => deserialized,
                Err(e) => {
                    tracing::warn!("skipping unusable index snapshot: {}", e);
                    continue;
                }
            };
            if newest.is_none() {
                newest = Some((entry.clone(), deserialized));
            } else {
                history.push(deserialized.graph);
                superseded.extend(entry.encrypted_name.clone());
            }
        }

        let Some((newest, Deserialized { graph, unresolved })) = newest else {
            return self.recover_flat(catalog).await;
        };
        self.graph = graph;
        self.previous_index = newest.encrypted_name.clone();

        let mut repaired = false;
        for (path, prefix) in unresolved {
            tracing::info!("index entry {} under {} has no blob", prefix, path);
            self.alerts
                .push(Alert::new(AlertKind::MissingBlob, path, None));
            repaired = true;
        }

        let referenced = self.graph.all_files();
        let orphans: Vec<&Entry> = catalog
            .iter()
            .filter(|(file, _)| !referenced.contains(*file))
            .map(|(_, entry)| entry)
            .collect();
        // unreadable orphans are only reported, they alone never trigger a save
        let groups = self.read_orphans(orphans).await;
        if !groups.is_empty() {
            tracing::info!("found orphaned blobs for {} nodes", groups.len());
            repaired = true;
        }

        let mut placements = Vec::new();
        for (id, entries) in groups {
            if self.graph.contains(&id) {
                self.merge_orphans(&id, entries).await?;
                continue;
            }
            let known = history.iter().find(|g| g.contains(&id));
            let depth = known.map(|g| g.depth(&id)).unwrap_or(1);
            placements.push((depth, entries[0].ts, id, entries, known));
        }
        // parents before the children that lived inside them
        placements.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        for (_, _, id, entries, known) in placements {
            let (target, kind) = match known {
                Some(older) => (self.nearest_ancestor(older, &id), AlertKind::Restored),
                None => (ROOT_ID.to_string(), AlertKind::Recovered),
            };
            self.attach_orphan(&target, entries, kind).await?;
        }

        if repaired {
            let saved = self.save().await;
            self.mark_broken(saved)?;
        }
        for file in superseded {
            if let Err(e) = self.storage.delete(&file).await {
                tracing::warn!("failed to delete superseded index {}: {}", file, e);
            }
        }
        Ok(())
    }

    /// Closest directory of the current graph among the historical ancestors of `id`
    fn nearest_ancestor(&self, older: &NodeGraph, id: &str) -> String {
        let mut cursor = older.get(id).and_then(|n| n.parent());
        while let Some(parent) = cursor {
            if self.graph.get(parent).is_some_and(|n| n.is_dir()) {
                return parent.to_string();
            }
            cursor = older.get(parent).and_then(|n| n.parent());
        }
        ROOT_ID.to_string()
    }

    /// Total index loss: every node goes directly under the root
    async fn recover_flat(&mut self, catalog: &BTreeMap<String, Entry>) -> Result<(), TreeError> {
        tracing::info!("no usable index snapshot, recovering {} blobs", catalog.len());
        let groups = self.read_orphans(catalog.values().collect()).await;
        let mut groups: Vec<Vec<Entry>> = groups.into_values().collect();
        groups.sort_by_key(|entries| entries[0].ts);
        for entries in groups {
            self.attach_orphan(ROOT_ID, entries, AlertKind::IndexLost)
                .await?;
        }
        let saved = self.save().await;
        self.mark_broken(saved)
    }

    /// Decrypt orphaned blobs into groups of versions per node id, oldest first.
    ///
    /// A body that does not decrypt (an interrupted write) is reported as
    ///  [`AlertKind::Unreadable`] and left on disk.
    async fn read_orphans(&mut self, orphans: Vec<&Entry>) -> BTreeMap<String, Vec<Entry>> {
        let mut groups: BTreeMap<String, Vec<Entry>> = BTreeMap::new();
        for item in orphans {
            let (Some(id), Some(file)) = (&item.id, &item.encrypted_name) else {
                continue;
            };
            match self.read_entry(file).await {
                Ok(entry) => groups.entry(id.clone()).or_default().push(entry),
                Err(e) => {
                    tracing::warn!("leaving unreadable orphan {} in place: {}", file, e);
                    let path = self
                        .graph
                        .path_of(id)
                        .unwrap_or_else(|_| item.name.clone().unwrap_or_default());
                    self.alerts
                        .push(Alert::new(AlertKind::Unreadable, path, Some(id.clone())));
                }
            }
        }
        for entries in groups.values_mut() {
            entries.sort_by_key(|e| e.ts);
        }
        groups
    }

    /// Attach an orphan group as a new node, suffixing its name on collision
    async fn attach_orphan(
        &mut self,
        target: &str,
        entries: Vec<Entry>,
        kind: AlertKind,
    ) -> Result<(), TreeError> {
        let content = entries.last().and_then(|e| e.content.clone());
        let mut entries = entries.into_iter();
        let Some(first) = entries.next() else {
            return Ok(());
        };
        let mut node = match Node::from_entry(&first) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!("cannot rebuild orphaned node: {}", e);
                return Ok(());
            }
        };
        for entry in entries {
            if let (Some(ts), Some(name), Some(file)) = (entry.ts, entry.name, entry.encrypted_name) {
                node.append_version(ts, Version { name, file });
            }
        }

        let id = node.id().to_string();
        let name = node.get_name(None)?.to_string();
        let free = suffixed_name(&name, |n| self.graph.find_child_by_name(target, n).is_some());
        self.graph.insert_child(target, node)?;
        if free != name {
            self.write_renamed_version(&id, free, content).await?;
        }

        let path = self.graph.path_of(&id)?;
        tracing::info!("reattached orphaned node {} at {} ({})", id, path, kind);
        self.alerts.push(Alert::new(kind, path, Some(id)));
        Ok(())
    }

    /// Orphaned versions of a node the index still references, already decrypted
    async fn merge_orphans(&mut self, id: &str, entries: Vec<Entry>) -> Result<(), TreeError> {
        for orphan in entries {
            let (Some(orphan_ts), Some(orphan_file)) = (orphan.ts, orphan.encrypted_name.clone())
            else {
                continue;
            };
            let node = self.graph.node(id)?;
            let current_ts = node.last_ts().ok_or(NodeError::MissingFields("versions"))?;
            let current_name = node.get_name(None)?.to_string();
            let current_file = node.get_file(None)?.to_string();
            let path = self.graph.path_of(id)?;
            let current = match self.read_entry(&current_file).await {
                Ok(current) => Some(current),
                Err(e) => {
                    tracing::warn!("current version of {} is unreadable: {}", path, e);
                    None
                }
            };
            let readable = current.is_some();
            let current_content = current.and_then(|c| c.content);
            let conflict = OrphanConflict {
                path: path.clone(),
                current_ts,
                current_name,
                current_content: current_content.clone().unwrap_or_default(),
                orphan_ts,
                orphan_name: orphan.name.clone().unwrap_or_default(),
                orphan_content: orphan.content.clone().unwrap_or_default(),
            };
            // nothing to compare against, keep the orphan
            let resolution = if readable {
                self.resolver.resolve(&conflict)
            } else {
                Resolution::AppendVersion
            };

            match resolution {
                Resolution::AppendVersion => {
                    if let Some(node) = self.graph.get_mut(id) {
                        node.append_version(
                            orphan_ts,
                            Version {
                                name: conflict.orphan_name.clone(),
                                file: orphan_file,
                            },
                        );
                    }
                    let content = if orphan_ts > current_ts {
                        orphan.content.clone()
                    } else {
                        current_content
                    };
                    self.ensure_unique_name(id, content).await?;
                    let path = self.graph.path_of(id)?;
                    tracing::info!("merged orphaned version {} into {}", orphan_ts, path);
                    self.alerts
                        .push(Alert::new(AlertKind::Merged, path, Some(id.to_string())));
                }
                Resolution::Discard => {
                    tracing::info!("dropping duplicate orphan of {}", path);
                    self.discard_blob(&orphan_file).await;
                    self.alerts
                        .push(Alert::new(AlertKind::Duplicate, path, Some(id.to_string())));
                }
                Resolution::Fork => {
                    let forked = self.fork_orphan(id, &orphan).await?;
                    self.discard_blob(&orphan_file).await;
                    let path = self.graph.path_of(&forked)?;
                    tracing::info!("forked divergent orphan of {} into {}", conflict.path, path);
                    self.alerts
                        .push(Alert::new(AlertKind::Forked, path, Some(forked)));
                }
            }
        }
        Ok(())
    }

    /// Rename the current version if a sibling already carries its name
    async fn ensure_unique_name(
        &mut self,
        id: &str,
        content: Option<String>,
    ) -> Result<(), TreeError> {
        let node = self.graph.node(id)?;
        let name = node.get_name(None)?.to_string();
        let parent = node.parent().unwrap_or(ROOT_ID).to_string();
        let taken = |candidate: &str| {
            self.graph.get(&parent).is_some_and(|p| {
                p.children().iter().any(|child| {
                    child != id
                        && self
                            .graph
                            .get(child)
                            .and_then(|c| c.get_name(None).ok())
                            .is_some_and(|n| n == candidate)
                })
            })
        };
        if !taken(&name) {
            return Ok(());
        }
        let free = suffixed_name(&name, taken);
        self.write_renamed_version(id, free, content).await
    }

    /// Write a new version of `id` carrying the current `content` under another name
    async fn write_renamed_version(
        &mut self,
        id: &str,
        name: String,
        content: Option<String>,
    ) -> Result<(), TreeError> {
        let node_type = self.graph.node(id)?.node_type();
        let entry = Entry {
            entry_type: Some(node_type),
            id: Some(id.to_string()),
            ts: Some(Timestamp::now()),
            name: Some(name.clone()),
            content,
            ..Default::default()
        };
        let written = self.write_version(&entry).await;
        let written = self.mark_broken(written)?;
        let file = written.encrypted_name.unwrap_or_default();
        self.disk.insert(file.clone());
        if let (Some(node), Some(ts)) = (self.graph.get_mut(id), written.ts) {
            node.append_version(ts, Version { name, file });
        }
        Ok(())
    }

    /// New sibling node carrying a divergent orphan's name and content
    async fn fork_orphan(&mut self, id: &str, orphan: &Entry) -> Result<String, TreeError> {
        let node = self.graph.node(id)?;
        let node_type = node.node_type();
        let parent = node.parent().unwrap_or(ROOT_ID).to_string();
        let name = orphan.name.clone().unwrap_or_default();
        let free = suffixed_name(&name, |n| self.graph.find_child_by_name(&parent, n).is_some());
        let entry = Entry {
            entry_type: Some(node_type),
            id: Some(self.graph.random_id()),
            ts: Some(Timestamp::now()),
            name: Some(free),
            content: orphan.content.clone(),
            ..Default::default()
        };
        let written = self.write_version(&entry).await;
        let written = self.mark_broken(written)?;
        if let Some(file) = &written.encrypted_name {
            self.disk.insert(file.clone());
        }
        let forked = Node::from_entry(&written)?;
        let forked_id = forked.id().to_string();
        self.graph.add(&parent, forked)?;
        Ok(forked_id)
    }

    async fn load_tags(&mut self, mut snapshots: Vec<Entry>) {
        snapshots.sort_by(|a, b| b.ts.cmp(&a.ts));
        let mut snapshots = snapshots.into_iter();
        let Some(newest) = snapshots.next() else {
            return;
        };
        let file = newest.encrypted_name.unwrap_or_default();
        match self.read_entry(&file).await {
            Ok(entry) => match TagIndex::from_json(&entry.content.unwrap_or_default()) {
                Ok(tags) => self.tags = tags,
                Err(e) => tracing::warn!("ignoring malformed tag snapshot: {}", e),
            },
            Err(e) => tracing::warn!("ignoring unreadable tag snapshot: {}", e),
        }
        self.previous_tags = Some(file);
        for older in snapshots {
            if let Some(file) = older.encrypted_name {
                if let Err(e) = self.storage.delete(&file).await {
                    tracing::warn!("failed to delete old tag snapshot {}: {}", file, e);
                }
            }
        }
    }

    /* Persistence */

    /// Write a fresh index snapshot, then delete the one written before it
    pub async fn save(&mut self) -> Result<(), TreeError> {
        if !self.save_enabled {
            tracing::debug!("save disabled, skipping index write");
            return Ok(());
        }
        let snapshot = Entry::new(EntryType::Root)
            .with_id(ROOT_ID)
            .with_name(random_string(8))
            .with_content(self.graph.to_json(&self.disk)?);
        let written = self.write_version(&snapshot).await?;
        let file = written.encrypted_name.unwrap_or_default();
        tracing::debug!("saved index snapshot ({} nodes)", self.graph.len() - 1);

        if let Some(previous) = self.previous_index.replace(file) {
            if let Err(e) = self.storage.delete(&previous).await {
                tracing::warn!("failed to delete previous index {}: {}", previous, e);
            }
        }
        Ok(())
    }

    /// Write the tag index as a fresh snapshot, then delete the previous one
    pub async fn save_tags(&mut self) -> Result<(), TreeError> {
        if !self.save_enabled {
            return Ok(());
        }
        let snapshot = Entry::new(EntryType::Tags)
            .with_id(TAGS_ID)
            .with_name(random_string(8))
            .with_content(self.tags.to_json()?);
        let written = self.write_version(&snapshot).await?;
        let file = written.encrypted_name.unwrap_or_default();
        if let Some(previous) = self.previous_tags.replace(file) {
            if let Err(e) = self.storage.delete(&previous).await {
                tracing::warn!("failed to delete previous tag snapshot {}: {}", previous, e);
            }
        }
        Ok(())
    }

    /* Mutations */

    fn validate_name(name: Option<&str>) -> Result<(), TreeError> {
        match name {
            Some(name) if name.is_empty() => Err(TreeError::Validation("empty name".into())),
            Some(name) if name.contains('/') => {
                Err(TreeError::Validation(format!("name contains '/': {}", name)))
            }
            _ => Ok(()),
        }
    }

    /// Create a node under `parent` from an entry without id; returns the new id
    pub async fn add(&mut self, parent: &str, entry: Entry) -> Result<String, TreeError> {
        self.ensure_loaded()?;
        if entry.id.is_some() {
            return Err(TreeError::Validation("a new entry cannot carry an id".into()));
        }
        if !entry.entry_type.is_some_and(|t| t.is_secret()) {
            return Err(TreeError::Validation("only folders and files can be added".into()));
        }
        if entry.name.is_none() {
            return Err(NodeError::MissingFields("name").into());
        }
        Self::validate_name(entry.name.as_deref())?;
        let target = self.graph.node(parent)?;
        if !target.is_dir() {
            return Err(NodeError::NotADirectory(self.graph.path_of(parent)?).into());
        }
        if let Some(existing) = entry
            .name
            .as_deref()
            .and_then(|n| self.graph.find_child_by_name(parent, n))
        {
            return Err(NodeError::EntryExists(self.graph.path_of(existing)?).into());
        }

        let id = self.graph.random_id();
        let entry = Entry {
            id: Some(id.clone()),
            ts: Some(Timestamp::now()),
            parent: Some(parent.to_string()),
            ..entry
        };
        // a name collision here means the blob is someone else's, leave it
        let written = self.write_version(&entry).await?;
        let file = written.encrypted_name.clone().unwrap_or_default();

        let attached = Node::from_entry(&written).and_then(|node| self.graph.add(parent, node));
        if let Err(e) = attached {
            self.discard_blob(&file).await;
            return Err(e.into());
        }
        self.disk.insert(file.clone());
        if let Err(e) = self.save().await {
            if let Err(undo) = self.graph.detach(&id) {
                tracing::warn!("failed to detach {} after a failed save: {}", id, undo);
            }
            self.discard_blob(&file).await;
            return Err(e);
        }
        tracing::debug!("added {} {}", id, self.graph.path_of(&id).unwrap_or_default());
        Ok(id)
    }

    /// Rename, move or rewrite a node.
    ///
    /// A new name or new content writes a new version; `entry.parent` moves
    ///  the node. Moving alone adds no version.
    pub async fn update(&mut self, id: &str, entry: Entry) -> Result<(), TreeError> {
        self.ensure_loaded()?;
        Self::validate_name(entry.name.as_deref())?;
        let node = self.graph.node(id)?;
        if node.is_root() {
            return Err(NodeError::RootImmutable.into());
        }
        if let Some(found) = &entry.id {
            if found != id {
                return Err(NodeError::IdMismatch {
                    expected: id.to_string(),
                    found: found.clone(),
                }
                .into());
            }
        }
        let current_name = node.get_name(None)?.to_string();
        let node_type = node.node_type();
        let renamed = entry.name.as_ref().is_some_and(|n| *n != current_name);
        let rewritten = entry.content.is_some();

        let mut entry = Entry {
            entry_type: Some(node_type),
            id: Some(id.to_string()),
            ..entry
        };
        let mut new_file = None;
        if renamed || rewritten {
            if entry.name.is_none() {
                entry.name = Some(current_name);
            }
            if entry.content.is_none() {
                let current_file = node.get_file(None)?.to_string();
                entry.content = self.read_entry(&current_file).await?.content;
            }
            entry.ts = Some(Timestamp::now());
            entry = self.write_version(&entry).await?;
            new_file = entry.encrypted_name.clone();
        } else {
            entry.ts = None;
        }

        let undo = match self.graph.move_node(id, &entry) {
            Ok(undo) => undo,
            Err(e) => {
                if let Some(file) = &new_file {
                    self.discard_blob(file).await;
                }
                return Err(e.into());
            }
        };
        if let Some(file) = &new_file {
            self.disk.insert(file.clone());
        }
        if let Err(e) = self.save().await {
            self.graph.undo_move(undo);
            if let Some(file) = &new_file {
                self.discard_blob(file).await;
            }
            return Err(e);
        }
        tracing::debug!("updated {} {}", id, self.graph.path_of(id).unwrap_or_default());
        Ok(())
    }

    /// Remove a whole node with its subtree, or a single version of it.
    ///
    /// The index stops referencing the blobs first; the blobs are deleted
    ///  afterwards, best-effort. Returns the deleted filenames.
    pub async fn remove(
        &mut self,
        id: &str,
        version: Option<Timestamp>,
    ) -> Result<Vec<String>, TreeError> {
        self.ensure_loaded()?;
        let node = self.graph.node(id)?;
        if node.is_root() {
            return Err(NodeError::RootImmutable.into());
        }
        if let Some(ts) = version {
            let file = node.get_file(Some(ts))?.to_string();
            if node.versions().len() > 1 {
                return self.remove_version(id, ts, file).await;
            }
        }

        let path = self.graph.path_of(id)?;
        let removed = self.graph.detach(id)?;
        if let Err(e) = self.save().await {
            self.graph.restore(removed);
            return Err(e);
        }
        let mut files = Vec::new();
        let mut untagged = false;
        for node in &removed {
            untagged |= !self.tags.tags_of(node.id()).is_empty();
            self.tags.forget(node.id());
            files.extend(node.versions().values().map(|v| v.file.clone()));
        }
        for file in &files {
            self.discard_blob(file).await;
        }
        if untagged {
            if let Err(e) = self.save_tags().await {
                tracing::warn!("failed to save tags after removing {}: {}", path, e);
            }
        }
        tracing::debug!("removed {} ({} blobs)", path, files.len());
        Ok(files)
    }

    async fn remove_version(
        &mut self,
        id: &str,
        ts: Timestamp,
        file: String,
    ) -> Result<Vec<String>, TreeError> {
        let Some(version) = self.graph.get_mut(id).and_then(|n| n.remove_version(ts)) else {
            return Err(NodeError::VersionNotFound(ts).into());
        };
        let restore = |tree: &mut Self, version: Version| {
            if let Some(node) = tree.graph.get_mut(id) {
                node.append_version(ts, version);
            }
        };
        // the previous version becomes current and must not shadow a sibling
        let node = self.graph.node(id)?;
        let name = node.get_name(None)?.to_string();
        let parent = node.parent().unwrap_or(ROOT_ID).to_string();
        let shadowed = self.graph.get(&parent).and_then(|p| {
            p.children()
                .iter()
                .filter(|c| c.as_str() != id)
                .find(|c| {
                    self.graph
                        .get(c)
                        .and_then(|n| n.get_name(None).ok())
                        .is_some_and(|n| n == name)
                })
                .cloned()
        });
        if let Some(other) = shadowed {
            let path = self.graph.path_of(&other)?;
            restore(&mut *self, version);
            return Err(NodeError::EntryExists(path).into());
        }
        if let Err(e) = self.save().await {
            restore(&mut *self, version);
            return Err(e);
        }
        self.discard_blob(&file).await;
        Ok(vec![file])
    }

    /// Decrypt one version of a node, the current one by default
    pub async fn get_entry_details(
        &self,
        id: &str,
        ts: Option<Timestamp>,
    ) -> Result<Entry, TreeError> {
        let node = self.graph.node(id)?;
        if node.is_root() {
            return Err(NodeError::RootImmutable.into());
        }
        let file = node.get_file(ts)?.to_string();
        self.read_entry(&file).await
    }

    /* Tags */

    pub async fn add_tag(&mut self, id: &str, tags: &[&str]) -> Result<(), TreeError> {
        self.ensure_loaded()?;
        if self.graph.node(id)?.is_root() {
            return Err(NodeError::RootImmutable.into());
        }
        self.tags.add(id, tags)?;
        self.save_tags().await
    }

    pub async fn remove_tag(&mut self, id: &str, tags: &[&str]) -> Result<(), TreeError> {
        self.ensure_loaded()?;
        self.tags.remove(id, tags);
        self.save_tags().await
    }

    /// `"tag (count)"` for every tag
    pub fn list_tags(&self) -> Vec<String> {
        self.tags.list()
    }

    /// Nodes carrying all `tags`, as `(path, "their tags")` sorted by path
    pub fn get_nodes_by_tag(&self, tags: &[&str]) -> Vec<(String, String)> {
        let mut found: Vec<(String, String)> = self
            .tags
            .ids_with_all(tags)
            .into_iter()
            .filter_map(|id| {
                let path = self.graph.path_of(&id).ok()?;
                Some((path, self.tags.tags_of(&id).join(" ")))
            })
            .collect();
        found.sort();
        found
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{Secret, SecretCipher};
    use crate::storage::MemoryStorage;

    async fn loaded() -> (Tree, MemoryStorage, Arc<SecretCipher>) {
        let cipher = Arc::new(SecretCipher::new(Secret::generate().unwrap()));
        let storage = MemoryStorage::new();
        let mut tree = Tree::new(cipher.clone(), Arc::new(storage.clone()));
        tree.load().await.unwrap();
        (tree, storage, cipher)
    }

    fn file(name: &str, content: &str) -> Entry {
        Entry::new(EntryType::File).with_name(name).with_content(content)
    }

    #[tokio::test]
    async fn test_mutations_require_load() {
        let cipher = Arc::new(SecretCipher::new(Secret::generate().unwrap()));
        let mut tree = Tree::new(cipher, Arc::new(MemoryStorage::new()));
        assert!(matches!(
            tree.add(ROOT_ID, file("a", "x")).await,
            Err(TreeError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn test_add_writes_blob_and_index() {
        let (mut tree, storage, _) = loaded().await;
        let id = tree.add(ROOT_ID, file("a", "secret")).await.unwrap();

        let files = storage.list().await.unwrap();
        // one version blob plus one index snapshot
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.starts_with('2')));
        assert!(files.iter().any(|f| f.starts_with('0')));

        let details = tree.get_entry_details(&id, None).await.unwrap();
        assert_eq!(details.content.as_deref(), Some("secret"));
        assert_eq!(tree.graph().path_of(&id).unwrap(), "/a");
    }

    #[tokio::test]
    async fn test_add_rejects_preset_id_and_duplicates() {
        let (mut tree, _, _) = loaded().await;
        let preset = file("a", "x").with_id("abcd");
        assert!(matches!(
            tree.add(ROOT_ID, preset).await,
            Err(TreeError::Validation(_))
        ));
        tree.add(ROOT_ID, file("a", "x")).await.unwrap();
        assert!(matches!(
            tree.add(ROOT_ID, file("a", "y")).await,
            Err(TreeError::Node(NodeError::EntryExists(_)))
        ));
    }

    #[tokio::test]
    async fn test_save_replaces_previous_index() {
        let (mut tree, storage, _) = loaded().await;
        tree.add(ROOT_ID, file("a", "1")).await.unwrap();
        tree.add(ROOT_ID, file("b", "2")).await.unwrap();
        let indexes: Vec<String> = storage
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|f| f.starts_with('0'))
            .collect();
        assert_eq!(indexes.len(), 1);
        assert_eq!(tree.index_file(), Some(indexes[0].as_str()));
    }

    #[tokio::test]
    async fn test_update_keeps_content_on_rename() {
        let (mut tree, _, _) = loaded().await;
        let id = tree.add(ROOT_ID, file("a", "keep me")).await.unwrap();
        tree.update(&id, Entry::default().with_name("b")).await.unwrap();

        let node = tree.graph().get(&id).unwrap();
        assert_eq!(node.versions().len(), 2);
        let details = tree.get_entry_details(&id, None).await.unwrap();
        assert_eq!(details.name.as_deref(), Some("b"));
        assert_eq!(details.content.as_deref(), Some("keep me"));
    }

    #[tokio::test]
    async fn test_remove_deletes_blobs_after_save() {
        let (mut tree, storage, _) = loaded().await;
        let dir = tree
            .add(ROOT_ID, Entry::new(EntryType::Dir).with_name("d"))
            .await
            .unwrap();
        tree.add(&dir, file("f", "x")).await.unwrap();
        tree.add_tag(&dir, &["web"]).await.unwrap();

        let removed = tree.remove(&dir, None).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(tree.graph().is_empty());
        assert!(tree.list_tags().is_empty());
        for file in removed {
            assert!(!storage.exists(&file).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_remove_single_version() {
        let (mut tree, _, _) = loaded().await;
        let id = tree.add(ROOT_ID, file("a", "v1")).await.unwrap();
        tree.update(&id, Entry::default().with_content("v2")).await.unwrap();
        let latest = tree.graph().get(&id).unwrap().last_ts().unwrap();

        tree.remove(&id, Some(latest)).await.unwrap();
        let details = tree.get_entry_details(&id, None).await.unwrap();
        assert_eq!(details.content.as_deref(), Some("v1"));
        assert!(matches!(
            tree.get_entry_details(&id, Some(latest)).await,
            Err(TreeError::Node(NodeError::VersionNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_tags() {
        let (mut tree, _, _) = loaded().await;
        let a = tree.add(ROOT_ID, file("a", "")).await.unwrap();
        let b = tree.add(ROOT_ID, file("b", "")).await.unwrap();
        let c = tree.add(ROOT_ID, file("c", "")).await.unwrap();
        tree.add_tag(&a, &["web"]).await.unwrap();
        tree.add_tag(&b, &["web", "wob"]).await.unwrap();
        tree.add_tag(&c, &["wib", "wob"]).await.unwrap();
        assert_eq!(tree.list_tags(), vec!["web (2)", "wib (1)", "wob (2)"]);

        tree.remove_tag(&b, &["web"]).await.unwrap();
        assert_eq!(
            tree.get_nodes_by_tag(&["wob"]),
            vec![
                ("/b".to_string(), "wob".to_string()),
                ("/c".to_string(), "wib wob".to_string())
            ]
        );
        assert_eq!(
            tree.get_nodes_by_tag(&["wob", "wib"]),
            vec![("/c".to_string(), "wib wob".to_string())]
        );
        assert!(matches!(
            tree.add_tag(&a, &["9lives"]).await,
            Err(TreeError::Tag(_))
        ));
    }
}
