//! Bulk import engine
//!
//! Moves large trees of items (folders and files, each with an ordered list
//! of versions) from a pluggable [`Source`] into a transactional
//! [`TargetStore`]. Items are cut into weight-bounded batches, each imported
//! in its own transaction, first on the scanning thread and then on a
//! backpressured worker pool. Jobs can be paused, resumed, and stopped, and
//! expose live status and counters while they run.

#![allow(clippy::new_without_default)]

pub mod backoff;
pub mod batch;
pub mod cancel;
pub mod completion;
pub mod config;
pub mod controller;
pub mod counters;
pub mod error;
pub mod importer;
pub mod model;
pub mod pauser;
pub mod pool;
pub mod scanner;
pub mod source;
pub mod status;
pub mod target;
pub mod util;

pub use batch::Batch;
pub use cancel::CancellationToken;
pub use completion::{CompletionHandler, LoggingCompletionHandler};
pub use config::{ImportConfig, ImportParameters};
pub use controller::BulkImporter;
pub use error::{ImportError, Result, TargetError};
pub use importer::{BatchImporter, BatchOutcome, ImportOptions};
pub use model::{ContentRef, Item, Version, VersionNumber};
pub use pauser::Pauser;
pub use pool::{ImportPool, PoolConfig, PoolFactory};
pub use source::{ImportCallback, ListSource, SampleSource, Source};
pub use status::{ImportStatus, JobDescriptor, ProcessingState, StatusSnapshot};
pub use target::{MemoryStore, NodeRef, TargetStore};
