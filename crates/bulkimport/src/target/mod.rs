//! The write side of an import.
//!
//! A [`TargetStore`] runs a unit of work inside one retrying transaction; the
//! work sees a [`TargetTxn`] with the handful of node operations the importer
//! needs. Missing parents surface as [`TargetError::MissingParent`] so the
//! importer can treat them as an out-of-order batch.

mod memory;

pub use memory::{MemoryStore, StoredContent, StoredNode, StoredVersion};

use crate::error::{ImportError, TargetError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

pub const DEFAULT_FOLDER_TYPE: &str = "cm:folder";
pub const DEFAULT_CONTENT_TYPE: &str = "cm:content";
pub const DEFAULT_NAMESPACE: &str = "cm";
pub const DEFAULT_PARENT_ASSOCIATION: &str = "cm:contains";
/// Marker that lets a node carry a version history.
pub const VERSIONABLE_ASPECT: &str = "cm:versionable";

/// Opaque handle to a node in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub u64);

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node://{}", self.0)
    }
}

/// Explicit per-transaction behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Suppress audit stamping (modifier, modified date) for imported nodes.
    pub disable_audit: bool,
    /// Run the work and discard it; used for dry runs.
    pub rollback_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKind {
    Major,
    Minor,
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionKind::Major => f.write_str("major"),
            VersionKind::Minor => f.write_str("minor"),
        }
    }
}

/// What to create under a parent.
#[derive(Debug, Clone)]
pub struct NewNode<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub association: &'a str,
    pub node_type: &'a str,
    pub is_folder: bool,
}

/// Node operations available inside one transaction.
pub trait TargetTxn {
    /// Resolve a `/`-separated path below `root`; `None` if any segment is absent.
    fn resolve_path(&mut self, root: NodeRef, path: &str) -> Result<Option<NodeRef>, TargetError>;

    fn find_child(&mut self, parent: NodeRef, name: &str) -> Result<Option<NodeRef>, TargetError>;

    fn create_node(&mut self, parent: NodeRef, node: NewNode<'_>) -> Result<NodeRef, TargetError>;

    fn set_type(&mut self, node: NodeRef, node_type: &str) -> Result<(), TargetError>;

    fn has_aspect(&mut self, node: NodeRef, aspect: &str) -> Result<bool, TargetError>;

    fn add_aspect(&mut self, node: NodeRef, aspect: &str) -> Result<(), TargetError>;

    fn add_properties(
        &mut self,
        node: NodeRef,
        properties: &BTreeMap<String, Value>,
    ) -> Result<(), TargetError>;

    /// Snapshot the node's current state as a new version; returns its label.
    fn create_version(
        &mut self,
        node: NodeRef,
        kind: VersionKind,
        comment: Option<&str>,
    ) -> Result<String, TargetError>;

    /// Copy bytes into the node; returns the number written.
    fn write_content(&mut self, node: NodeRef, content: &mut dyn Read) -> Result<u64, TargetError>;

    /// Point the node at content already in the store's content area.
    fn link_content(&mut self, node: NodeRef, location: &str, size: u64) -> Result<(), TargetError>;
}

/// Unit of work run inside [`TargetStore::execute_in_txn`]. Called again on
/// every retry, so it must not carry state between attempts.
pub type TxnWork<'a> = dyn FnMut(&mut dyn TargetTxn) -> Result<(), ImportError> + 'a;

/// A transactional write target.
pub trait TargetStore: Send + Sync {
    fn describe(&self) -> String;

    /// Validate an import target outside any transaction: it must exist, be
    /// a folder, and be writable.
    fn resolve_target(&self, path: &str) -> Result<NodeRef, TargetError>;

    /// Run `work` atomically. Conflicts are retried internally; any other
    /// error rolls the transaction back and is returned unchanged.
    fn execute_in_txn(&self, options: &WriteOptions, work: &mut TxnWork<'_>) -> Result<(), ImportError>;
}
