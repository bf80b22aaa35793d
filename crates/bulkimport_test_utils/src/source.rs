//! A source that replays fixed items and can be held mid-scan.

use bulkimport::config::ImportParameters;
use bulkimport::error::{ImportError, Result};
use bulkimport::model::Item;
use bulkimport::source::{ImportCallback, Source};
use bulkimport::status::ImportStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// One-shot latch the source parks on until a test opens it.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
    reached: AtomicBool,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }

    /// True once the source is parked at the gate.
    pub fn is_reached(&self) -> bool {
        self.reached.load(Ordering::SeqCst)
    }

    fn pass(&self, callback: &dyn ImportCallback) -> Result<()> {
        self.reached.store(true, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        while !*open {
            if callback.is_cancelled() {
                return Err(ImportError::Interrupted("waiting at test gate".to_string()));
            }
            open = self
                .cv
                .wait_timeout(open, Duration::from_millis(10))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedSource {
    name: String,
    folders: Vec<Item>,
    files: Vec<Item>,
    in_place: bool,
    gate: Option<(usize, Arc<Gate>)>,
    init_failure: Option<String>,
    scan_failure_after: Option<usize>,
    submitted: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_folder(mut self, item: Item) -> Self {
        self.folders.push(item);
        self
    }

    pub fn with_folders(mut self, items: impl IntoIterator<Item = Item>) -> Self {
        self.folders.extend(items);
        self
    }

    pub fn with_file(mut self, item: Item) -> Self {
        self.files.push(item);
        self
    }

    pub fn with_files(mut self, items: impl IntoIterator<Item = Item>) -> Self {
        self.files.extend(items);
        self
    }

    pub fn with_in_place(mut self) -> Self {
        self.in_place = true;
        self
    }

    /// Park before submitting file number `index` (zero based) until `gate` opens.
    pub fn with_gate_before_file(mut self, index: usize, gate: Arc<Gate>) -> Self {
        self.gate = Some((index, gate));
        self
    }

    pub fn with_init_failure(mut self, message: &str) -> Self {
        self.init_failure = Some(message.to_string());
        self
    }

    /// Fail the file scan after `count` files have been submitted.
    pub fn with_scan_failure_after(mut self, count: usize) -> Self {
        self.scan_failure_after = Some(count);
        self
    }

    /// Items handed to the engine so far.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    fn submit(&self, callback: &dyn ImportCallback, item: &Item) -> Result<()> {
        callback.submit(item.clone())?;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Source for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, _status: &ImportStatus, _params: &ImportParameters) -> Result<()> {
        match &self.init_failure {
            Some(message) => Err(ImportError::Source(message.clone())),
            None => Ok(()),
        }
    }

    fn in_place_import_possible(&self) -> bool {
        self.in_place
    }

    fn scan_folders(&self, status: &ImportStatus, callback: &dyn ImportCallback) -> Result<()> {
        for item in &self.folders {
            status.set_currently_scanning(Some(item.path()));
            self.submit(callback, item)?;
        }
        Ok(())
    }

    fn scan_files(&self, status: &ImportStatus, callback: &dyn ImportCallback) -> Result<()> {
        for (index, item) in self.files.iter().enumerate() {
            if self.scan_failure_after == Some(index) {
                return Err(ImportError::Source(format!(
                    "scripted failure after {} files",
                    index
                )));
            }
            if let Some((at, gate)) = &self.gate {
                if *at == index {
                    gate.pass(callback)?;
                }
            }
            status.set_currently_scanning(Some(item.path()));
            self.submit(callback, item)?;
        }
        Ok(())
    }
}
