//! The read side of an import.
//!
//! A [`Source`] discovers items and hands them to an [`ImportCallback`] in two
//! ordered phases: every folder first, then every file. Within a phase each
//! parent must be submitted before its children.

mod list;
pub mod sample;

pub use list::ListSource;
pub use sample::SampleSource;

use crate::config::ImportParameters;
use crate::error::Result;
use crate::model::Item;
use crate::status::ImportStatus;

/// Where a source submits discovered items.
pub trait ImportCallback {
    /// Hand one item to the engine. May block (backpressure); fails once the
    /// job is cancelled or if the item is invalid.
    fn submit(&self, item: Item) -> Result<()>;

    /// True once the job is stopping; sources should return promptly.
    fn is_cancelled(&self) -> bool;
}

/// A discoverer of items. Sources are called from a single scanner thread.
pub trait Source: Send + Sync {
    /// Registry key, e.g. `"sample"`.
    fn name(&self) -> &str;

    fn description(&self) -> String {
        self.name().to_string()
    }

    /// Prepare for a job; register source counters here.
    fn init(&self, status: &ImportStatus, params: &ImportParameters) -> Result<()>;

    /// True if content is already where the target stores it.
    fn in_place_import_possible(&self) -> bool {
        false
    }

    fn scan_folders(&self, status: &ImportStatus, callback: &dyn ImportCallback) -> Result<()>;

    fn scan_files(&self, status: &ImportStatus, callback: &dyn ImportCallback) -> Result<()>;
}
