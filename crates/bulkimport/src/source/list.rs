use super::{ImportCallback, Source};
use crate::config::ImportParameters;
use crate::error::{ImportError, Result};
use crate::model::Item;
use crate::status::ImportStatus;

/// A source over a fixed list of items, already in parent-first order.
#[derive(Debug, Clone)]
pub struct ListSource {
    name: String,
    folders: Vec<Item>,
    files: Vec<Item>,
    in_place: bool,
}

impl ListSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folders: Vec::new(),
            files: Vec::new(),
            in_place: false,
        }
    }

    /// Add an item to the phase matching its kind.
    pub fn with_item(mut self, item: Item) -> Self {
        if item.is_directory() {
            self.folders.push(item);
        } else {
            self.files.push(item);
        }
        self
    }

    pub fn with_items(self, items: impl IntoIterator<Item = Item>) -> Self {
        items.into_iter().fold(self, Self::with_item)
    }

    pub fn with_in_place(mut self, in_place: bool) -> Self {
        self.in_place = in_place;
        self
    }

    pub fn len(&self) -> usize {
        self.folders.len() + self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }

    fn submit_all(&self, items: &[Item], callback: &dyn ImportCallback) -> Result<()> {
        for item in items {
            if callback.is_cancelled() {
                return Err(ImportError::Interrupted(format!("scanning {}", self.name)));
            }
            callback.submit(item.clone())?;
        }
        Ok(())
    }
}

impl Source for ListSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!(
            "{} ({} folders, {} files)",
            self.name,
            self.folders.len(),
            self.files.len()
        )
    }

    fn init(&self, _status: &ImportStatus, _params: &ImportParameters) -> Result<()> {
        Ok(())
    }

    fn in_place_import_possible(&self) -> bool {
        self.in_place
    }

    fn scan_folders(&self, status: &ImportStatus, callback: &dyn ImportCallback) -> Result<()> {
        status.set_currently_scanning(Some(format!("{} folders", self.name)));
        self.submit_all(&self.folders, callback)
    }

    fn scan_files(&self, status: &ImportStatus, callback: &dyn ImportCallback) -> Result<()> {
        status.set_currently_scanning(Some(format!("{} files", self.name)));
        self.submit_all(&self.files, callback)
    }
}
