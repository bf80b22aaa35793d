//! Error types for the bulk import engine

use std::io;
use thiserror::Error;

/// Errors raised by a [`crate::target::TargetStore`] or one of its transactions.
#[derive(Error, Debug)]
pub enum TargetError {
    /// The declared parent of an item has not been imported yet.
    #[error("Parent '{path}' does not exist in the target")]
    MissingParent { path: String },

    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Node already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a folder: {0}")]
    NotAFolder(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Optimistic commit lost a race; the store retries these itself.
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Transaction rolled back after {attempts} conflicting attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Bulk import error type
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: String, message: String },

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// A control call that is illegal in the current processing state.
    #[error("{0}")]
    StateConflict(String),

    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Batch #{batch} still out of order after {attempts} attempts (missing parent '{missing_parent}')")]
    OutOfOrderRetriesExhausted {
        batch: u64,
        attempts: u32,
        missing_parent: String,
    },

    /// Cooperative cancellation was observed.
    #[error("Interrupted while {0}")]
    Interrupted(String),

    #[error("Target error: {0}")]
    Target(#[from] TargetError),

    #[error("Failed to import '{item}': {source}")]
    Item {
        item: String,
        #[source]
        source: Box<ImportError>,
    },

    #[error("Source error: {0}")]
    Source(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Task panicked: {0}")]
    Panic(String),

    /// The pool refused a task after its permit was granted.
    #[error("Worker pool admission invariant violated: {0}")]
    Admission(String),
}

impl ImportError {
    /// Attach the offending item's path to a per-item failure.
    pub fn for_item(item: impl std::fmt::Display, source: ImportError) -> Self {
        ImportError::Item {
            item: item.to_string(),
            source: Box::new(source),
        }
    }

    /// True if this error (or the error it wraps) came from cancellation.
    pub fn is_interruption(&self) -> bool {
        match self {
            ImportError::Interrupted(_) => true,
            ImportError::Item { source, .. } => source.is_interruption(),
            ImportError::Io(e) => e.kind() == io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    /// The missing parent path if this is an out-of-order signal.
    pub fn missing_parent(&self) -> Option<&str> {
        match self {
            ImportError::Target(TargetError::MissingParent { path }) => Some(path),
            ImportError::Item { source, .. } => source.missing_parent(),
            _ => None,
        }
    }

    /// True for optimistic-concurrency failures a store should retry.
    pub fn is_conflict(&self) -> bool {
        match self {
            ImportError::Target(TargetError::Conflict(_)) => true,
            ImportError::Item { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ImportError>;

/// Render a caught panic payload for logs and status.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
