//! In-memory target store with optimistic transactions.
//!
//! Each transaction stages its writes privately and validates them against
//! the committed tree at commit time: a node modified by a newer commit, or a
//! child name taken since the transaction looked it up, is a conflict and the
//! whole unit of work is retried.

use super::{NewNode, NodeRef, TargetStore, TargetTxn, TxnWork, VersionKind, WriteOptions};
use crate::error::{ImportError, TargetError};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

const ROOT: NodeRef = NodeRef(0);
const DEFAULT_CONFLICT_RETRIES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredContent {
    Inline(Vec<u8>),
    Linked { location: String, size: u64 },
}

impl StoredContent {
    pub fn size(&self) -> u64 {
        match self {
            StoredContent::Inline(bytes) => bytes.len() as u64,
            StoredContent::Linked { size, .. } => *size,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredVersion {
    pub label: String,
    pub kind: VersionKind,
    pub comment: Option<String>,
    pub properties: BTreeMap<String, Value>,
    pub content_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredNode {
    pub id: NodeRef,
    pub parent: Option<NodeRef>,
    pub name: String,
    pub namespace: String,
    pub association: String,
    pub node_type: String,
    pub is_folder: bool,
    pub aspects: BTreeSet<String>,
    pub properties: BTreeMap<String, Value>,
    pub content: Option<StoredContent>,
    pub versions: Vec<StoredVersion>,
    /// Commit that last wrote this node.
    pub revision: u64,
    /// Written with auditing enabled.
    pub audited: bool,
}

impl StoredNode {
    fn folder(id: NodeRef, parent: Option<NodeRef>, name: &str) -> Self {
        Self {
            id,
            parent,
            name: name.to_string(),
            namespace: super::DEFAULT_NAMESPACE.to_string(),
            association: super::DEFAULT_PARENT_ASSOCIATION.to_string(),
            node_type: super::DEFAULT_FOLDER_TYPE.to_string(),
            is_folder: true,
            aspects: BTreeSet::new(),
            properties: BTreeMap::new(),
            content: None,
            versions: Vec::new(),
            revision: 0,
            audited: true,
        }
    }
}

#[derive(Debug)]
struct Committed {
    revision: u64,
    nodes: BTreeMap<NodeRef, StoredNode>,
    children: BTreeMap<(NodeRef, String), NodeRef>,
    read_only: BTreeSet<NodeRef>,
}

impl Committed {
    fn resolve(&self, root: NodeRef, path: &str) -> Option<NodeRef> {
        segments(path).try_fold(root, |parent, name| {
            self.children.get(&(parent, name.to_string())).copied()
        })
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Reference [`TargetStore`] holding everything in memory.
#[derive(Debug)]
pub struct MemoryStore {
    committed: Mutex<Committed>,
    next_id: AtomicU64,
    max_attempts: u32,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT, StoredNode::folder(ROOT, None, ""));
        Self {
            committed: Mutex::new(Committed {
                revision: 0,
                nodes,
                children: BTreeMap::new(),
                read_only: BTreeSet::new(),
            }),
            next_id: AtomicU64::new(1),
            max_attempts: DEFAULT_CONFLICT_RETRIES,
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    pub fn with_conflict_retries(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Create (if needed) a chain of folders and commit it immediately.
    pub fn create_folder_path(&self, path: &str) -> Result<NodeRef, TargetError> {
        let mut committed = self.lock();
        let mut parent = ROOT;
        for name in segments(path) {
            let key = (parent, name.to_string());
            parent = match committed.children.get(&key) {
                Some(id) => *id,
                None => {
                    let id = NodeRef(self.next_id.fetch_add(1, Ordering::SeqCst));
                    committed.nodes.insert(id, StoredNode::folder(id, Some(parent), name));
                    committed.children.insert(key, id);
                    id
                }
            };
        }
        Ok(parent)
    }

    /// Refuse writes below `path`.
    pub fn mark_read_only(&self, path: &str) -> Result<(), TargetError> {
        let mut committed = self.lock();
        let id = committed
            .resolve(ROOT, path)
            .ok_or_else(|| TargetError::NotFound(path.to_string()))?;
        committed.read_only.insert(id);
        Ok(())
    }

    /// Committed node at `path` (relative to the store root).
    pub fn node_at(&self, path: &str) -> Option<StoredNode> {
        let committed = self.lock();
        let id = committed.resolve(ROOT, path)?;
        committed.nodes.get(&id).cloned()
    }

    /// Names of the committed children of `path`, sorted.
    pub fn children(&self, path: &str) -> Vec<String> {
        let committed = self.lock();
        let Some(parent) = committed.resolve(ROOT, path) else {
            return Vec::new();
        };
        committed
            .children
            .keys()
            .filter(|(p, _)| *p == parent)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Committed nodes, excluding the root.
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len() - 1
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Committed> {
        self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> MemoryTxn<'_> {
        MemoryTxn {
            store: self,
            read_revision: self.lock().revision,
            staged: BTreeMap::new(),
            touched: BTreeSet::new(),
            new_children: BTreeMap::new(),
            absent_lookups: BTreeSet::new(),
        }
    }
}

impl TargetStore for MemoryStore {
    fn describe(&self) -> String {
        format!("in-memory store ({} nodes)", self.node_count())
    }

    fn resolve_target(&self, path: &str) -> Result<NodeRef, TargetError> {
        let committed = self.lock();
        let id = committed
            .resolve(ROOT, path)
            .ok_or_else(|| TargetError::NotFound(path.to_string()))?;
        let node = committed
            .nodes
            .get(&id)
            .ok_or_else(|| TargetError::NotFound(path.to_string()))?;
        if !node.is_folder {
            return Err(TargetError::NotAFolder(path.to_string()));
        }
        if committed.read_only.contains(&id) {
            return Err(TargetError::PermissionDenied(path.to_string()));
        }
        Ok(id)
    }

    fn execute_in_txn(&self, options: &WriteOptions, work: &mut TxnWork<'_>) -> Result<(), ImportError> {
        let mut last_conflict = String::new();
        for attempt in 1..=self.max_attempts {
            let mut txn = self.begin();
            match work(&mut txn) {
                Ok(()) if options.rollback_only => {
                    trace!("Rollback-only transaction discarded");
                    self.rollbacks.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                Ok(()) => match txn.commit(options) {
                    Ok(revision) => {
                        trace!(revision, "Transaction committed");
                        self.commits.fetch_add(1, Ordering::SeqCst);
                        return Ok(());
                    }
                    Err(TargetError::Conflict(message)) => {
                        debug!(attempt, conflict = %message, "Commit conflict; retrying transaction");
                        last_conflict = message;
                    }
                    Err(e) => {
                        self.rollbacks.fetch_add(1, Ordering::SeqCst);
                        return Err(e.into());
                    }
                },
                Err(e) if e.is_conflict() => {
                    debug!(attempt, error = %e, "Conflict inside transaction; retrying");
                    self.rollbacks.fetch_add(1, Ordering::SeqCst);
                    last_conflict = e.to_string();
                }
                Err(e) => {
                    self.rollbacks.fetch_add(1, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        Err(TargetError::RetriesExhausted {
            attempts: self.max_attempts,
            message: last_conflict,
        }
        .into())
    }
}

struct MemoryTxn<'s> {
    store: &'s MemoryStore,
    read_revision: u64,
    staged: BTreeMap<NodeRef, StoredNode>,
    /// Committed nodes this transaction modified.
    touched: BTreeSet<NodeRef>,
    new_children: BTreeMap<(NodeRef, String), NodeRef>,
    absent_lookups: BTreeSet<(NodeRef, String)>,
}

impl MemoryTxn<'_> {
    fn with_node<R>(&self, id: NodeRef, f: impl FnOnce(&StoredNode) -> R) -> Result<R, TargetError> {
        if let Some(node) = self.staged.get(&id) {
            return Ok(f(node));
        }
        let committed = self.store.lock();
        committed
            .nodes
            .get(&id)
            .map(f)
            .ok_or_else(|| TargetError::NotFound(id.to_string()))
    }

    fn node_mut(&mut self, id: NodeRef) -> Result<&mut StoredNode, TargetError> {
        if !self.staged.contains_key(&id) {
            let committed = self.store.lock();
            if committed.read_only.contains(&id) {
                return Err(TargetError::PermissionDenied(id.to_string()));
            }
            let node = committed
                .nodes
                .get(&id)
                .cloned()
                .ok_or_else(|| TargetError::NotFound(id.to_string()))?;
            drop(committed);
            self.touched.insert(id);
            self.staged.insert(id, node);
        }
        self.staged
            .get_mut(&id)
            .ok_or_else(|| TargetError::NotFound(id.to_string()))
    }

    fn commit(self, options: &WriteOptions) -> Result<u64, TargetError> {
        let mut committed = self.store.lock();
        for id in &self.touched {
            let current = committed.nodes.get(id).map_or(0, |n| n.revision);
            if current > self.read_revision {
                return Err(TargetError::Conflict(format!("{} modified concurrently", id)));
            }
        }
        for key in self.new_children.keys().chain(self.absent_lookups.iter()) {
            if committed.children.contains_key(key) {
                return Err(TargetError::Conflict(format!(
                    "'{}' created concurrently under {}",
                    key.1, key.0
                )));
            }
        }

        committed.revision += 1;
        let revision = committed.revision;
        for (id, mut node) in self.staged {
            node.revision = revision;
            node.audited = !options.disable_audit;
            committed.nodes.insert(id, node);
        }
        committed.children.extend(self.new_children);
        Ok(revision)
    }
}

impl TargetTxn for MemoryTxn<'_> {
    fn resolve_path(&mut self, root: NodeRef, path: &str) -> Result<Option<NodeRef>, TargetError> {
        let mut current = root;
        for name in segments(path) {
            match self.find_child(current, name)? {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn find_child(&mut self, parent: NodeRef, name: &str) -> Result<Option<NodeRef>, TargetError> {
        let key = (parent, name.to_string());
        if let Some(id) = self.new_children.get(&key) {
            return Ok(Some(*id));
        }
        let found = self.store.lock().children.get(&key).copied();
        if found.is_none() {
            self.absent_lookups.insert(key);
        }
        Ok(found)
    }

    fn create_node(&mut self, parent: NodeRef, node: NewNode<'_>) -> Result<NodeRef, TargetError> {
        let parent_is_folder = self.with_node(parent, |p| p.is_folder)?;
        if !parent_is_folder {
            return Err(TargetError::NotAFolder(parent.to_string()));
        }
        if self.store.lock().read_only.contains(&parent) {
            return Err(TargetError::PermissionDenied(parent.to_string()));
        }
        let key = (parent, node.name.to_string());
        let seen_absent = self.absent_lookups.contains(&key);
        if self.find_child(parent, node.name)?.is_some() {
            // Absent when this transaction looked, so another commit beat us to it.
            if seen_absent {
                return Err(TargetError::Conflict(format!(
                    "'{}' created concurrently under {}",
                    node.name, parent
                )));
            }
            return Err(TargetError::AlreadyExists(format!("{}/{}", parent, node.name)));
        }

        let id = NodeRef(self.store.next_id.fetch_add(1, Ordering::SeqCst));
        let stored = StoredNode {
            id,
            parent: Some(parent),
            name: node.name.to_string(),
            namespace: node.namespace.to_string(),
            association: node.association.to_string(),
            node_type: node.node_type.to_string(),
            is_folder: node.is_folder,
            aspects: BTreeSet::new(),
            properties: BTreeMap::new(),
            content: None,
            versions: Vec::new(),
            revision: 0,
            audited: true,
        };
        self.staged.insert(id, stored);
        self.new_children.insert(key, id);
        Ok(id)
    }

    fn set_type(&mut self, node: NodeRef, node_type: &str) -> Result<(), TargetError> {
        self.node_mut(node)?.node_type = node_type.to_string();
        Ok(())
    }

    fn has_aspect(&mut self, node: NodeRef, aspect: &str) -> Result<bool, TargetError> {
        self.with_node(node, |n| n.aspects.contains(aspect))
    }

    fn add_aspect(&mut self, node: NodeRef, aspect: &str) -> Result<(), TargetError> {
        self.node_mut(node)?.aspects.insert(aspect.to_string());
        Ok(())
    }

    fn add_properties(
        &mut self,
        node: NodeRef,
        properties: &BTreeMap<String, Value>,
    ) -> Result<(), TargetError> {
        let stored = self.node_mut(node)?;
        for (name, value) in properties {
            stored.properties.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    fn create_version(
        &mut self,
        node: NodeRef,
        kind: VersionKind,
        comment: Option<&str>,
    ) -> Result<String, TargetError> {
        let stored = self.node_mut(node)?;
        let (major, minor) = stored
            .versions
            .last()
            .and_then(|v| v.label.split_once('.'))
            .and_then(|(m, n)| Some((m.parse::<u32>().ok()?, n.parse::<u32>().ok()?)))
            .unwrap_or((0, 0));
        let label = match kind {
            VersionKind::Major => format!("{}.0", major + 1),
            VersionKind::Minor => format!("{}.{}", major, minor + 1),
        };
        stored.versions.push(StoredVersion {
            label: label.clone(),
            kind,
            comment: comment.map(str::to_string),
            properties: stored.properties.clone(),
            content_size: stored.content.as_ref().map(StoredContent::size),
        });
        Ok(label)
    }

    fn write_content(&mut self, node: NodeRef, content: &mut dyn Read) -> Result<u64, TargetError> {
        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes)?;
        let written = bytes.len() as u64;
        self.node_mut(node)?.content = Some(StoredContent::Inline(bytes));
        Ok(written)
    }

    fn link_content(&mut self, node: NodeRef, location: &str, size: u64) -> Result<(), TargetError> {
        self.node_mut(node)?.content = Some(StoredContent::Linked {
            location: location.to_string(),
            size,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{DEFAULT_CONTENT_TYPE, DEFAULT_NAMESPACE, DEFAULT_PARENT_ASSOCIATION};
    use std::io::Cursor;

    fn new_file(name: &str) -> NewNode<'_> {
        NewNode {
            name,
            namespace: DEFAULT_NAMESPACE,
            association: DEFAULT_PARENT_ASSOCIATION,
            node_type: DEFAULT_CONTENT_TYPE,
            is_folder: false,
        }
    }

    #[test]
    fn test_resolve_target_validation() {
        let store = MemoryStore::new();
        store.create_folder_path("import/target").unwrap();

        assert!(store.resolve_target("import/target").is_ok());
        assert!(matches!(
            store.resolve_target("import/missing"),
            Err(TargetError::NotFound(_))
        ));

        let target = store.resolve_target("import").unwrap();
        store
            .execute_in_txn(&WriteOptions::default(), &mut |txn| {
                txn.create_node(target, new_file("doc.txt"))?;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            store.resolve_target("import/doc.txt"),
            Err(TargetError::NotAFolder(_))
        ));

        store.mark_read_only("import/target").unwrap();
        assert!(matches!(
            store.resolve_target("import/target"),
            Err(TargetError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_commit_makes_writes_visible() {
        let store = MemoryStore::new();
        let target = store.create_folder_path("t").unwrap();

        store
            .execute_in_txn(&WriteOptions { disable_audit: true, rollback_only: false }, &mut |txn| {
                let node = txn.create_node(target, new_file("a.txt"))?;
                txn.add_aspect(node, "cm:titled")?;
                let mut props = BTreeMap::new();
                props.insert("cm:title".to_string(), Value::from("A"));
                txn.add_properties(node, &props)?;
                txn.write_content(node, &mut Cursor::new(b"hello".to_vec()))?;
                Ok(())
            })
            .unwrap();

        let node = store.node_at("t/a.txt").unwrap();
        assert_eq!(node.content, Some(StoredContent::Inline(b"hello".to_vec())));
        assert!(node.aspects.contains("cm:titled"));
        assert_eq!(node.properties["cm:title"], Value::from("A"));
        assert!(!node.audited);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn test_error_rolls_back_everything() {
        let store = MemoryStore::new();
        let target = store.create_folder_path("t").unwrap();

        let result = store.execute_in_txn(&WriteOptions::default(), &mut |txn| {
            txn.create_node(target, new_file("a.txt"))?;
            match txn.resolve_path(target, "missing/parent")? {
                Some(_) => Ok(()),
                None => Err(TargetError::MissingParent {
                    path: "missing/parent".to_string(),
                }
                .into()),
            }
        });

        assert_eq!(result.unwrap_err().missing_parent(), Some("missing/parent"));
        assert!(store.node_at("t/a.txt").is_none());
        assert_eq!(store.rollback_count(), 1);
    }

    #[test]
    fn test_rollback_only_discards() {
        let store = MemoryStore::new();
        let target = store.create_folder_path("t").unwrap();
        store
            .execute_in_txn(&WriteOptions { disable_audit: false, rollback_only: true }, &mut |txn| {
                txn.create_node(target, new_file("ghost.txt"))?;
                Ok(())
            })
            .unwrap();
        assert!(store.children("t").is_empty());
    }

    #[test]
    fn test_conflicting_commit_is_retried() {
        let store = MemoryStore::new();
        let target = store.create_folder_path("t").unwrap();
        let mut attempts = 0;

        store
            .execute_in_txn(&WriteOptions::default(), &mut |txn| {
                attempts += 1;
                if txn.find_child(target, "shared.txt")?.is_some() {
                    return Ok(());
                }
                txn.create_node(target, new_file("shared.txt"))?;
                if attempts == 1 {
                    // Another writer commits the same name first.
                    store
                        .execute_in_txn(&WriteOptions::default(), &mut |other| {
                            other.create_node(target, new_file("shared.txt"))?;
                            Ok(())
                        })
                        .unwrap();
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(store.children("t"), vec!["shared.txt".to_string()]);
    }

    #[test]
    fn test_version_labels() {
        let store = MemoryStore::new();
        let target = store.create_folder_path("t").unwrap();
        store
            .execute_in_txn(&WriteOptions::default(), &mut |txn| {
                let node = txn.create_node(target, new_file("v.txt"))?;
                assert_eq!(txn.create_version(node, VersionKind::Major, None)?, "1.0");
                assert_eq!(txn.create_version(node, VersionKind::Minor, Some("fix"))?, "1.1");
                assert_eq!(txn.create_version(node, VersionKind::Minor, None)?, "1.2");
                assert_eq!(txn.create_version(node, VersionKind::Major, None)?, "2.0");
                Ok(())
            })
            .unwrap();
        let node = store.node_at("t/v.txt").unwrap();
        assert_eq!(node.versions.len(), 4);
        assert_eq!(node.versions[1].comment.as_deref(), Some("fix"));
    }
}
