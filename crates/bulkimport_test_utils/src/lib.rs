//! Bulk Import Test Utilities
//!
//! Item fixtures, a scriptable source, and a fault-injecting target store for
//! exercising the engine end to end.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bulkimport_test_utils::{fixtures, FlakyStore, ScriptedSource};
//!
//! let store = Arc::new(FlakyStore::new());
//! store.hide_parent("docs", 1);
//! let source = ScriptedSource::new("scripted")
//!     .with_folder(fixtures::folder("docs"))
//!     .with_file(fixtures::text_file("docs/a.txt", "hello"));
//! ```

pub mod fixtures;
pub mod source;
pub mod store;

pub use source::{Gate, ScriptedSource};
pub use store::{FlakyStore, TxnRecord};

use std::thread;
use std::time::{Duration, Instant};

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
