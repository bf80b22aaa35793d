//! Batches whose parents have not landed yet are rolled back and retried.

use bulkimport::counters;
use bulkimport::{BulkImporter, ImportConfig, ImportError, ImportParameters, ImportStatus};
use bulkimport_test_utils::{fixtures, FlakyStore, ScriptedSource, TxnRecord};
use std::sync::Arc;
use std::time::Duration;

fn create_test_env() -> Arc<FlakyStore> {
    let store = Arc::new(FlakyStore::new());
    store.memory().create_folder_path("import").unwrap();
    store
}

fn config(threshold: u64, single_threaded_folders: bool, retries: u32) -> ImportConfig {
    ImportConfig {
        batch_weight: 2,
        pool_size: 4,
        queue_capacity: 4,
        multithreading_threshold: threshold,
        single_threaded_folder_phase: single_threaded_folders,
        drain_poll_interval_ms: 5,
        max_out_of_order_retries: retries,
        ..ImportConfig::default()
    }
}

fn docs_source() -> ScriptedSource {
    ScriptedSource::new("docs")
        .with_folder(fixtures::folder("docs"))
        .with_file(fixtures::text_file("docs/a.txt", "alpha"))
        .with_file(fixtures::text_file("docs/b.txt", "beta"))
}

fn count(status: &ImportStatus, name: &str) -> i64 {
    status.target_counter(name).unwrap_or(0)
}

#[test]
fn test_out_of_order_batch_is_retried_until_parent_appears() {
    let store = create_test_env();
    store.hide_parent("docs", 2);
    let importer = BulkImporter::new(store.clone(), config(1_000, true, 10));

    importer
        .start_with_source(Arc::new(docs_source()), ImportParameters::new(), "import")
        .unwrap();
    importer.await_completion().unwrap();

    let status = importer.status();
    assert!(status.succeeded(), "state {:?}", status.processing_state());
    assert_eq!(count(&status, counters::BATCHES_REQUEUED), 2);
    // The retried batch keeps its identity: no new batch was cut for it.
    assert_eq!(count(&status, counters::BATCHES_SUBMITTED), 2);
    assert_eq!(count(&status, counters::BATCHES_COMPLETED), 2);
    assert_eq!(count(&status, counters::NODES_CREATED), 3);

    let rolled_back = TxnRecord {
        created: Vec::new(),
        committed: false,
    };
    assert_eq!(
        store.txn_log(),
        vec![
            TxnRecord {
                created: vec!["docs".to_string()],
                committed: true,
            },
            rolled_back.clone(),
            rolled_back,
            TxnRecord {
                created: vec!["a.txt".to_string(), "b.txt".to_string()],
                committed: true,
            },
        ]
    );
    assert!(store.memory().node_at("import/docs/b.txt").is_some());
}

#[test]
fn test_pool_requeues_out_of_order_batches() {
    let store = create_test_env();
    store.hide_parent("docs", 3);
    // Threshold 0 and a parallel folder phase: everything goes through the pool.
    let importer = BulkImporter::new(store.clone(), config(0, false, 50));

    importer
        .start_with_source(Arc::new(docs_source()), ImportParameters::new(), "import")
        .unwrap();
    importer.await_completion().unwrap();

    let status = importer.status();
    assert!(status.succeeded(), "state {:?}", status.processing_state());
    assert!(count(&status, counters::BATCHES_REQUEUED) >= 3);
    assert_eq!(count(&status, counters::BATCHES_SUBMITTED), 2);
    assert_eq!(count(&status, counters::BATCHES_COMPLETED), 2);
    assert_eq!(store.memory().children("import/docs"), vec!["a.txt", "b.txt"]);
}

#[test]
fn test_slow_parent_transaction_does_not_fail_the_job() {
    let store = create_test_env();
    store.slow_create("docs", Duration::from_millis(500));
    let importer = BulkImporter::new(
        store.clone(),
        ImportConfig {
            batch_weight: 1,
            ..config(0, false, 100)
        },
    );
    let source = ScriptedSource::new("docs")
        .with_folder(fixtures::folder("docs"))
        .with_file(fixtures::text_file("docs/a.txt", "alpha"));

    importer
        .start_with_source(Arc::new(source), ImportParameters::new(), "import")
        .unwrap();
    importer.await_completion().unwrap();

    let status = importer.status();
    assert!(
        status.succeeded(),
        "state {:?}, error {:?}",
        status.processing_state(),
        status.last_error().map(|e| e.to_string())
    );
    let requeued = count(&status, counters::BATCHES_REQUEUED);
    assert!(requeued >= 1);
    // Backoff spaces the retries out instead of spinning on the queue.
    assert!(requeued < 20, "requeued {} times", requeued);
    assert_eq!(count(&status, counters::BATCHES_COMPLETED), 2);
    assert!(store.memory().node_at("import/docs/a.txt").is_some());
}

#[test]
fn test_retries_are_bounded() {
    let store = create_test_env();
    store.hide_parent("docs", u32::MAX);
    let importer = BulkImporter::new(store.clone(), config(1_000, true, 3));

    importer
        .start_with_source(Arc::new(docs_source()), ImportParameters::new(), "import")
        .unwrap();
    importer.await_completion().unwrap();

    let status = importer.status();
    assert!(status.failed());
    match status.last_error().unwrap().as_ref() {
        ImportError::OutOfOrderRetriesExhausted {
            batch,
            attempts,
            missing_parent,
        } => {
            assert_eq!(*batch, 2);
            assert_eq!(*attempts, 3);
            assert_eq!(missing_parent, "docs");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(count(&status, counters::BATCHES_REQUEUED), 2);
    assert!(store.memory().node_at("import/docs/a.txt").is_none());
}
