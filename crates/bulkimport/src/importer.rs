//! Applies one batch to the target inside a single transaction.

use crate::batch::Batch;
use crate::cancel::CancellationToken;
use crate::counters::BatchTally;
use crate::error::{ImportError, Result, TargetError};
use crate::model::{Item, Version};
use crate::status::ImportStatus;
use crate::target::{
    NewNode, NodeRef, TargetStore, TargetTxn, VersionKind, WriteOptions, DEFAULT_CONTENT_TYPE,
    DEFAULT_FOLDER_TYPE, DEFAULT_NAMESPACE, DEFAULT_PARENT_ASSOCIATION, VERSIONABLE_ASPECT,
};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Per-job importer behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Update nodes that already exist instead of skipping them.
    pub replace_existing: bool,
    /// Run every batch in a rollback-only transaction.
    pub dry_run: bool,
}

/// Result of one attempt at a batch.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Committed; the tally is ready to be applied to status.
    Imported(BatchTally),
    /// Rolled back because a parent is not in the target yet.
    OutOfOrder { missing_parent: String },
    /// Rolled back because the job is stopping or was cancelled.
    Interrupted,
    /// Rolled back; the job must fail.
    Failed(ImportError),
}

/// Consumer side of the engine: imports batches into a [`TargetStore`].
pub struct BatchImporter {
    store: Arc<dyn TargetStore>,
    status: Arc<ImportStatus>,
    cancel: CancellationToken,
    target: NodeRef,
    options: ImportOptions,
}

impl BatchImporter {
    pub fn new(
        store: Arc<dyn TargetStore>,
        status: Arc<ImportStatus>,
        cancel: CancellationToken,
        target: NodeRef,
        options: ImportOptions,
    ) -> Self {
        Self {
            store,
            status,
            cancel,
            target,
            options,
        }
    }

    pub fn options(&self) -> ImportOptions {
        self.options
    }

    /// Import every item of `batch`, in order, as one unit of work.
    pub fn import_batch(&self, batch: &Batch) -> BatchOutcome {
        debug!(batch = batch.number(), items = batch.len(), "Importing batch");
        let label = batch.to_string();
        self.status.set_currently_importing(Some(label.clone()));

        let write_options = WriteOptions {
            disable_audit: true,
            rollback_only: self.options.dry_run,
        };
        let mut tally = BatchTally::default();
        let result = self.store.execute_in_txn(&write_options, &mut |txn: &mut dyn TargetTxn| {
            // A retried transaction starts counting from scratch.
            tally = BatchTally::default();
            for item in batch.items() {
                self.cancel.check("importing batch")?;
                self.import_item(txn, item, &mut tally)
                    .map_err(|e| ImportError::for_item(item, e))?;
            }
            Ok(())
        });
        self.status.finished_importing(&label);

        match result {
            Ok(()) => {
                trace!(batch = batch.number(), "Batch imported");
                BatchOutcome::Imported(tally)
            }
            Err(e) if self.cancel.is_cancelled() || self.status.is_stopping() => {
                debug!(batch = batch.number(), error = %e, "Batch interrupted by stop request");
                BatchOutcome::Interrupted
            }
            Err(e) => match e.missing_parent() {
                Some(parent) => BatchOutcome::OutOfOrder {
                    missing_parent: parent.to_string(),
                },
                None if e.is_interruption() => BatchOutcome::Interrupted,
                None => BatchOutcome::Failed(e),
            },
        }
    }

    fn import_item(&self, txn: &mut dyn TargetTxn, item: &Item, tally: &mut BatchTally) -> Result<()> {
        trace!(item = %item, "Importing item");
        let versions = item.versions();
        if versions.is_empty() {
            return Err(ImportError::InvalidState(format!("{} has no versions", item)));
        }

        let parent = self.resolve_parent(txn, item)?;
        let node = match txn.find_child(parent, item.name())? {
            Some(_) if !self.options.replace_existing => {
                info!(item = %item, "Skipping existing node; replaceExisting is off");
                tally.nodes_skipped += 1;
                return Ok(());
            }
            Some(existing) => {
                trace!(item = %item, node = %existing, "Replacing existing node");
                tally.nodes_replaced += 1;
                existing
            }
            None => {
                let node_type = if item.is_directory() {
                    DEFAULT_FOLDER_TYPE
                } else {
                    DEFAULT_CONTENT_TYPE
                };
                let created = txn.create_node(
                    parent,
                    NewNode {
                        name: item.name(),
                        namespace: item.namespace().unwrap_or(DEFAULT_NAMESPACE),
                        association: item.parent_association().unwrap_or(DEFAULT_PARENT_ASSOCIATION),
                        node_type,
                        is_folder: item.is_directory(),
                    },
                )?;
                tally.nodes_created += 1;
                created
            }
        };

        if item.is_directory() {
            self.import_directory(txn, node, item, tally)
        } else {
            self.import_file(txn, node, item, tally)
        }
    }

    fn resolve_parent(&self, txn: &mut dyn TargetTxn, item: &Item) -> Result<NodeRef> {
        let Some(parent_path) = item.parent_path() else {
            return Ok(self.target);
        };
        match txn.resolve_path(self.target, parent_path)? {
            Some(parent) => Ok(parent),
            // Earlier batches were rolled back, so their folders never appear.
            None if self.options.dry_run => {
                info!(item = %item, parent = parent_path, "[DRY RUN] Parent not in target; using import target instead");
                Ok(self.target)
            }
            None => Err(TargetError::MissingParent {
                path: parent_path.to_string(),
            }
            .into()),
        }
    }

    fn import_directory(
        &self,
        txn: &mut dyn TargetTxn,
        node: NodeRef,
        item: &Item,
        tally: &mut BatchTally,
    ) -> Result<()> {
        let versions = item.versions();
        if versions.len() > 1 {
            warn!(
                item = %item,
                versions = versions.len(),
                "Directory has multiple versions; only the last version's metadata is imported"
            );
        }
        let Some(last) = versions.last() else {
            return Ok(());
        };
        if last.has_content() {
            warn!(item = %item, "Directory has content; ignoring it");
        }
        self.import_metadata(txn, node, last, tally)
    }

    fn import_file(
        &self,
        txn: &mut dyn TargetTxn,
        node: NodeRef,
        item: &Item,
        tally: &mut BatchTally,
    ) -> Result<()> {
        let versions = item.versions();
        if let [only] = versions {
            // No history: skip the version record entirely.
            return self.import_version_contents(txn, node, only, tally);
        }

        let first_declares_versionable = versions
            .first()
            .map_or(false, |v| v.aspects().contains(VERSIONABLE_ASPECT));
        if !first_declares_versionable && !txn.has_aspect(node, VERSIONABLE_ASPECT)? {
            debug!(item = %item, "Item has versions but is not versionable; adding marker");
            txn.add_aspect(node, VERSIONABLE_ASPECT)?;
        }

        let mut previous: Option<&Version> = None;
        for version in versions {
            self.cancel.check("importing versions")?;
            self.import_version_contents(txn, node, version, tally)?;

            // The first version is the node itself; history starts with the second.
            if previous.is_some() {
                let kind = version_kind(previous, version);
                if self.options.dry_run {
                    info!(item = %item, kind = %kind, "[DRY RUN] Would have created version");
                } else {
                    let label = txn.create_version(node, kind, version.comment())?;
                    trace!(item = %item, label = %label, kind = %kind, "Created version");
                }
                tally.versions_imported += 1;
            }
            previous = Some(version);
        }
        Ok(())
    }

    fn import_version_contents(
        &self,
        txn: &mut dyn TargetTxn,
        node: NodeRef,
        version: &Version,
        tally: &mut BatchTally,
    ) -> Result<()> {
        if version.has_metadata() {
            self.import_metadata(txn, node, version, tally)?;
        }
        if let Some(content) = version.content() {
            if self.options.dry_run {
                info!(
                    node = %node,
                    location = %content.location,
                    in_place = content.in_place,
                    "[DRY RUN] Would have imported content"
                );
            } else if content.in_place {
                txn.link_content(node, &content.location, content.size_in_bytes)?;
                tally.in_place_content_linked += 1;
                tally.bytes_imported += content.size_in_bytes;
            } else {
                let mut reader = content.open()?;
                let written = txn.write_content(node, reader.as_mut())?;
                tally.content_streamed += 1;
                tally.bytes_imported += written;
            }
        }
        Ok(())
    }

    fn import_metadata(
        &self,
        txn: &mut dyn TargetTxn,
        node: NodeRef,
        version: &Version,
        tally: &mut BatchTally,
    ) -> Result<()> {
        if let Some(node_type) = version.node_type() {
            txn.set_type(node, node_type)?;
        }
        for aspect in version.aspects() {
            self.cancel.check("associating aspects")?;
            txn.add_aspect(node, aspect)?;
            tally.aspects_associated += 1;
        }
        let properties = version.properties();
        if !properties.is_empty() {
            for name in properties.keys() {
                self.cancel.check("importing metadata")?;
                trace!(node = %node, property = %name, "Importing property");
            }
            txn.add_properties(node, properties)?;
            tally.metadata_properties_imported += properties.len() as u64;
        }
        Ok(())
    }
}

/// MAJOR unless the number moved by less than one whole version.
fn version_kind(previous: Option<&Version>, version: &Version) -> VersionKind {
    match (previous.and_then(Version::number), version.number()) {
        (Some(prev), Some(current)) if !current.is_major_step_from(&prev) => VersionKind::Minor,
        _ => VersionKind::Major,
    }
}
