//! Fault-injecting wrapper around the in-memory target.

use bulkimport::error::{ImportError, TargetError};
use bulkimport::target::{
    MemoryStore, NewNode, NodeRef, TargetStore, TargetTxn, TxnWork, VersionKind, WriteOptions,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// What one call to `execute_in_txn` tried to create, and whether it stuck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnRecord {
    pub created: Vec<String>,
    pub committed: bool,
}

#[derive(Default)]
struct Faults {
    /// Parent path -> transactions that still see it as absent.
    hidden: HashMap<String, u32>,
    failing_names: BTreeSet<String>,
    /// Node name -> time spent inside the transaction creating it.
    slow_names: HashMap<String, Duration>,
    log: Vec<TxnRecord>,
}

/// A [`MemoryStore`] that can hide parents, fail named nodes, and slow
/// transactions down, while recording every attempt.
pub struct FlakyStore {
    inner: MemoryStore,
    faults: Mutex<Faults>,
    delay: Mutex<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            faults: Mutex::new(Faults::default()),
            delay: Mutex::new(Duration::ZERO),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    /// Make `path` resolve as absent for the next `txns` transactions that look it up.
    pub fn hide_parent(&self, path: &str, txns: u32) {
        self.faults().hidden.insert(path.to_string(), txns);
    }

    /// Creating a node called `name` fails with a storage error.
    pub fn fail_on(&self, name: &str) {
        self.faults().failing_names.insert(name.to_string());
    }

    /// Creating a node called `name` holds its transaction open for `delay`.
    pub fn slow_create(&self, name: &str, delay: Duration) {
        self.faults().slow_names.insert(name.to_string(), delay);
    }

    /// Sleep this long at the start of every transaction.
    pub fn set_txn_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn txn_log(&self) -> Vec<TxnRecord> {
        self.faults().log.clone()
    }

    /// Highest number of transactions seen running at once.
    pub fn max_concurrent_txns(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FlakyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetStore for FlakyStore {
    fn describe(&self) -> String {
        format!("flaky {}", self.inner.describe())
    }

    fn resolve_target(&self, path: &str) -> Result<NodeRef, TargetError> {
        self.inner.resolve_target(path)
    }

    fn execute_in_txn(&self, options: &WriteOptions, work: &mut TxnWork<'_>) -> Result<(), ImportError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut created = Vec::new();
        let mut hidden_hits = BTreeSet::new();
        let result = self.inner.execute_in_txn(options, &mut |txn: &mut dyn TargetTxn| {
            created.clear();
            let mut faulty = FaultyTxn {
                inner: txn,
                store: self,
                created: &mut created,
                hidden_hits: &mut hidden_hits,
            };
            work(&mut faulty)
        });

        let mut faults = self.faults();
        for path in hidden_hits {
            if let Some(remaining) = faults.hidden.get_mut(&path) {
                *remaining = remaining.saturating_sub(1);
            }
        }
        faults.log.push(TxnRecord {
            created,
            committed: result.is_ok() && !options.rollback_only,
        });
        drop(faults);

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct FaultyTxn<'a, 'b> {
    inner: &'a mut (dyn TargetTxn + 'b),
    store: &'a FlakyStore,
    created: &'a mut Vec<String>,
    hidden_hits: &'a mut BTreeSet<String>,
}

impl TargetTxn for FaultyTxn<'_, '_> {
    fn resolve_path(&mut self, root: NodeRef, path: &str) -> Result<Option<NodeRef>, TargetError> {
        let hidden = self
            .store
            .faults()
            .hidden
            .get(path)
            .map_or(false, |remaining| *remaining > 0);
        if hidden {
            debug!(path, "Hiding parent from transaction");
            self.hidden_hits.insert(path.to_string());
            return Ok(None);
        }
        self.inner.resolve_path(root, path)
    }

    fn find_child(&mut self, parent: NodeRef, name: &str) -> Result<Option<NodeRef>, TargetError> {
        self.inner.find_child(parent, name)
    }

    fn create_node(&mut self, parent: NodeRef, node: NewNode<'_>) -> Result<NodeRef, TargetError> {
        let slow = {
            let faults = self.store.faults();
            if faults.failing_names.contains(node.name) {
                return Err(TargetError::Storage(format!("injected failure creating {}", node.name)));
            }
            faults.slow_names.get(node.name).copied()
        };
        if let Some(delay) = slow {
            debug!(name = node.name, delay_ms = delay.as_millis() as u64, "Slow node creation");
            thread::sleep(delay);
        }
        let name = node.name.to_string();
        let created = self.inner.create_node(parent, node)?;
        self.created.push(name);
        Ok(created)
    }

    fn set_type(&mut self, node: NodeRef, node_type: &str) -> Result<(), TargetError> {
        self.inner.set_type(node, node_type)
    }

    fn has_aspect(&mut self, node: NodeRef, aspect: &str) -> Result<bool, TargetError> {
        self.inner.has_aspect(node, aspect)
    }

    fn add_aspect(&mut self, node: NodeRef, aspect: &str) -> Result<(), TargetError> {
        self.inner.add_aspect(node, aspect)
    }

    fn add_properties(
        &mut self,
        node: NodeRef,
        properties: &BTreeMap<String, Value>,
    ) -> Result<(), TargetError> {
        self.inner.add_properties(node, properties)
    }

    fn create_version(
        &mut self,
        node: NodeRef,
        kind: VersionKind,
        comment: Option<&str>,
    ) -> Result<String, TargetError> {
        self.inner.create_version(node, kind, comment)
    }

    fn write_content(&mut self, node: NodeRef, content: &mut dyn Read) -> Result<u64, TargetError> {
        self.inner.write_content(node, content)
    }

    fn link_content(&mut self, node: NodeRef, location: &str, size: u64) -> Result<(), TargetError> {
        self.inner.link_content(node, location, size)
    }
}
