//! Canonical counter names and the concurrent counter map behind them.
//!
//! Use these constants everywhere to avoid stringly-typed drift.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Batches cut by the scanner (requeues are not counted again).
pub const BATCHES_SUBMITTED: &str = "Batches submitted";
/// Batches whose transaction committed.
pub const BATCHES_COMPLETED: &str = "Batches completed";
/// Out-of-order attempts that were rolled back and requeued.
pub const BATCHES_REQUEUED: &str = "Batches requeued";
/// Nodes created or replaced.
pub const NODES_IMPORTED: &str = "Nodes imported";
pub const NODES_CREATED: &str = "Nodes created";
/// Existing nodes updated because `replaceExisting` was set.
pub const NODES_REPLACED: &str = "Nodes replaced";
/// Existing nodes left alone.
pub const NODES_SKIPPED: &str = "Nodes skipped";
pub const IN_PLACE_CONTENT_LINKED: &str = "In place content linked";
pub const CONTENT_STREAMED: &str = "Content streamed";
pub const BYTES_IMPORTED: &str = "Bytes imported";
pub const VERSIONS_IMPORTED: &str = "Versions imported";
pub const ASPECTS_ASSOCIATED: &str = "Aspects associated";
pub const METADATA_PROPERTIES_IMPORTED: &str = "Metadata properties imported";

/// Target counters every job reports, even when they stay at zero.
pub const DEFAULT_TARGET_COUNTERS: &[&str] = &[
    BATCHES_SUBMITTED,
    BATCHES_COMPLETED,
    BATCHES_REQUEUED,
    NODES_IMPORTED,
    NODES_CREATED,
    NODES_REPLACED,
    NODES_SKIPPED,
    IN_PLACE_CONTENT_LINKED,
    CONTENT_STREAMED,
    BYTES_IMPORTED,
    VERSIONS_IMPORTED,
    ASPECTS_ASSOCIATED,
    METADATA_PROPERTIES_IMPORTED,
];

/// Named, monotonically increasing counters safe under concurrent increment.
///
/// Increments of an existing name only take the read lock.
#[derive(Debug, Default)]
pub struct CounterSet {
    counters: RwLock<BTreeMap<String, Arc<AtomicI64>>>,
}

impl CounterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register names at zero so they are always listed.
    pub fn preregister(&self, names: &[&str]) {
        for name in names {
            self.counter(name);
        }
    }

    pub fn increment(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, value: i64) {
        self.counter(name).fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
    }

    /// Counter names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, c)| (name.clone(), c.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn clear(&self) {
        self.counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn counter(&self, name: &str) -> Arc<AtomicI64> {
        if let Some(c) = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(c);
        }
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            counters
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AtomicI64::new(0))),
        )
    }
}

/// Target-side counter deltas for one batch attempt.
///
/// Only applied once the batch has committed, so a rolled-back attempt
/// contributes nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchTally {
    pub nodes_created: u64,
    pub nodes_replaced: u64,
    pub nodes_skipped: u64,
    pub versions_imported: u64,
    pub aspects_associated: u64,
    pub metadata_properties_imported: u64,
    pub in_place_content_linked: u64,
    pub content_streamed: u64,
    pub bytes_imported: u64,
}

impl BatchTally {
    /// Items handled by this attempt, whether written or skipped.
    pub fn nodes_processed(&self) -> u64 {
        self.nodes_created + self.nodes_replaced + self.nodes_skipped
    }

    pub fn apply_to(&self, counters: &CounterSet) {
        let deltas = [
            (NODES_CREATED, self.nodes_created),
            (NODES_REPLACED, self.nodes_replaced),
            (NODES_IMPORTED, self.nodes_created + self.nodes_replaced),
            (NODES_SKIPPED, self.nodes_skipped),
            (VERSIONS_IMPORTED, self.versions_imported),
            (ASPECTS_ASSOCIATED, self.aspects_associated),
            (METADATA_PROPERTIES_IMPORTED, self.metadata_properties_imported),
            (IN_PLACE_CONTENT_LINKED, self.in_place_content_linked),
            (CONTENT_STREAMED, self.content_streamed),
            (BYTES_IMPORTED, self.bytes_imported),
        ];
        for (name, value) in deltas {
            if value > 0 {
                counters.add(name, i64::try_from(value).unwrap_or(i64::MAX));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_preregistered_counters_are_listed_at_zero() {
        let counters = CounterSet::new();
        counters.preregister(DEFAULT_TARGET_COUNTERS);

        assert_eq!(counters.get(NODES_SKIPPED), Some(0));
        assert_eq!(counters.names().len(), DEFAULT_TARGET_COUNTERS.len());
        assert_eq!(counters.get("never registered"), None);

        let names = counters.names();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_concurrent_increments() {
        let counters = Arc::new(CounterSet::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = Arc::clone(&counters);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        counters.increment(NODES_CREATED);
                        counters.add(BYTES_IMPORTED, 3);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counters.get(NODES_CREATED), Some(8_000));
        assert_eq!(counters.get(BYTES_IMPORTED), Some(24_000));
    }

    #[test]
    fn test_tally_applies_nodes_imported_as_created_plus_replaced() {
        let counters = CounterSet::new();
        counters.preregister(DEFAULT_TARGET_COUNTERS);
        let tally = BatchTally {
            nodes_created: 3,
            nodes_replaced: 2,
            nodes_skipped: 1,
            bytes_imported: 42,
            ..BatchTally::default()
        };
        tally.apply_to(&counters);

        assert_eq!(tally.nodes_processed(), 6);
        assert_eq!(counters.get(NODES_IMPORTED), Some(5));
        assert_eq!(counters.get(NODES_SKIPPED), Some(1));
        assert_eq!(counters.get(BYTES_IMPORTED), Some(42));
        assert_eq!(counters.get(VERSIONS_IMPORTED), Some(0));
    }
}
