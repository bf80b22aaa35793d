use crate::error::{ImportError, Result};
use crate::model::Item;
use std::fmt;
use std::sync::Arc;

/// An immutable, numbered group of items imported in one transaction.
///
/// Cloning shares the item list, so a requeued batch is the same batch:
/// same number, same items, same order.
#[derive(Debug, Clone)]
pub struct Batch {
    number: u64,
    items: Arc<[Item]>,
}

impl Batch {
    pub fn new(number: u64, items: Vec<Item>) -> Result<Self> {
        if number == 0 {
            return Err(ImportError::InvalidState(
                "batch numbers start at 1".to_string(),
            ));
        }
        if items.is_empty() {
            return Err(ImportError::InvalidState(format!(
                "batch #{} has no items",
                number
            )));
        }
        Ok(Self {
            number,
            items: items.into(),
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.items.iter().map(Item::size_in_bytes).sum()
    }

    /// Versions that will produce version records (items with history only).
    pub fn number_of_versions(&self) -> usize {
        self.items
            .iter()
            .map(Item::number_of_versions)
            .filter(|&n| n > 1)
            .sum()
    }

    pub fn number_of_aspects(&self) -> usize {
        self.items.iter().map(Item::number_of_aspects).sum()
    }

    pub fn number_of_metadata_properties(&self) -> usize {
        self.items.iter().map(Item::number_of_metadata_properties).sum()
    }

    pub fn weight(&self) -> u64 {
        self.items.iter().map(Item::weight).sum()
    }

    /// True if both handles point at the same underlying item list.
    pub fn same_contents(&self, other: &Batch) -> bool {
        Arc::ptr_eq(&self.items, &other.items)
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch #{} ({} item{})",
            self.number,
            self.items.len(),
            crate::util::pluralise(self.items.len())
        )
    }
}
