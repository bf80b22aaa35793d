//! End-to-end imports through the controller.

use bulkimport::config::{PARAM_DRY_RUN, PARAM_REPLACE_EXISTING};
use bulkimport::counters;
use bulkimport::source::sample::{PARAM_FILES_PER_FOLDER, PARAM_FOLDER_COUNT, PARAM_VERSIONS_PER_FILE};
use bulkimport::{
    BulkImporter, ImportConfig, ImportParameters, ImportStatus, MemoryStore, ProcessingState,
    SampleSource, TargetStore,
};
use bulkimport_test_utils::{fixtures, FlakyStore, ScriptedSource};
use std::sync::Arc;

fn config(batch_weight: u64, threshold: u64) -> ImportConfig {
    ImportConfig {
        batch_weight,
        pool_size: 4,
        queue_capacity: 4,
        multithreading_threshold: threshold,
        drain_poll_interval_ms: 5,
        max_out_of_order_retries: 10,
        ..ImportConfig::default()
    }
}

fn create_test_env(store: Arc<dyn TargetStore>, config: ImportConfig) -> BulkImporter {
    let importer = BulkImporter::new(store, config);
    importer.register_source(Arc::new(SampleSource::new()));
    importer
}

fn memory_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.create_folder_path("import").unwrap();
    store
}

fn counter(status: &ImportStatus, name: &str) -> i64 {
    status.target_counter(name).unwrap_or(0)
}

// ============================================================================
// Sample source
// ============================================================================

#[test]
fn test_sample_import_lands_every_node() {
    let store = memory_store();
    let importer = create_test_env(store.clone(), config(5, 2));

    importer.start("sample", ImportParameters::new(), "import").unwrap();
    importer.await_completion().unwrap();

    let status = importer.status();
    assert_eq!(status.processing_state(), ProcessingState::Succeeded);
    assert!(status.last_error().is_none());

    // 6 folders + 1 root file + 6 folders x 2 files
    assert_eq!(store.node_count(), 1 + 6 + 13);
    assert_eq!(counter(&status, counters::NODES_CREATED), 19);
    assert_eq!(counter(&status, counters::NODES_IMPORTED), 19);
    assert_eq!(
        counter(&status, counters::BATCHES_SUBMITTED),
        counter(&status, counters::BATCHES_COMPLETED)
    );

    let history = store.node_at("import/folder2/folder2.1/file1.txt").unwrap();
    assert_eq!(history.versions.len(), 9);
    let single = store.node_at("import/folder2/file2.txt").unwrap();
    assert!(single.versions.is_empty());
    assert_eq!(
        store.children("import/folder1"),
        vec!["file1.txt", "file2.txt", "folder1.1"]
    );
}

#[test]
fn test_sample_shape_from_parameters() {
    let store = memory_store();
    let importer = create_test_env(store.clone(), config(100, 3));
    let params = ImportParameters::new()
        .with(PARAM_FOLDER_COUNT, "1")
        .with(PARAM_FILES_PER_FOLDER, "3")
        .with(PARAM_VERSIONS_PER_FILE, "2");

    importer.start("sample", params, "import").unwrap();
    importer.await_completion().unwrap();

    assert!(importer.status().succeeded());
    // 2 folders + 1 root file + 2 x 3 files
    assert_eq!(store.node_count(), 1 + 2 + 7);
    assert_eq!(store.node_at("import/folder1/file1.txt").unwrap().versions.len(), 1);
    assert_eq!(importer.status().source_counter("Files synthesised"), Some(7));
}

#[test]
fn test_dry_run_writes_nothing_but_counts() {
    let store = memory_store();
    let importer = create_test_env(store.clone(), config(5, 2));

    importer
        .start("sample", ImportParameters::new().with(PARAM_DRY_RUN, "true"), "import")
        .unwrap();
    importer.await_completion().unwrap();

    let status = importer.status();
    assert!(status.succeeded());
    assert!(status.is_dry_run());
    assert_eq!(store.node_count(), 1);
    assert!(store.children("import").is_empty());
    assert_eq!(counter(&status, counters::NODES_CREATED), 19);
    assert_eq!(counter(&status, counters::BYTES_IMPORTED), 0);
}

// ============================================================================
// Existing nodes
// ============================================================================

#[test]
fn test_second_run_skips_or_replaces_existing() {
    let store = memory_store();
    let importer = create_test_env(store.clone(), config(10, 3));

    importer.start("sample", ImportParameters::new(), "import").unwrap();
    importer.await_completion().unwrap();
    let nodes = store.node_count();

    importer.start("sample", ImportParameters::new(), "import").unwrap();
    importer.await_completion().unwrap();
    let status = importer.status();
    assert!(status.succeeded());
    assert_eq!(store.node_count(), nodes);
    assert_eq!(counter(&status, counters::NODES_SKIPPED), 19);
    assert_eq!(counter(&status, counters::NODES_CREATED), 0);

    importer
        .start(
            "sample",
            ImportParameters::new().with(PARAM_REPLACE_EXISTING, "true"),
            "import",
        )
        .unwrap();
    importer.await_completion().unwrap();
    let status = importer.status();
    assert!(status.succeeded());
    assert_eq!(store.node_count(), nodes);
    assert_eq!(counter(&status, counters::NODES_REPLACED), 19);
    assert_eq!(counter(&status, counters::NODES_IMPORTED), 19);
}

#[test]
fn test_processed_nodes_add_up_to_items() {
    let store = memory_store();
    // Pre-create part of the tree so the run mixes created and skipped nodes.
    store.create_folder_path("import/folder1").unwrap();
    store.create_folder_path("import/folder2/folder2.1").unwrap();
    let importer = create_test_env(store.clone(), config(7, 1));

    importer.start("sample", ImportParameters::new(), "import").unwrap();
    importer.await_completion().unwrap();

    let status = importer.status();
    assert!(status.succeeded());
    assert_eq!(counter(&status, counters::NODES_SKIPPED), 3);
    assert_eq!(
        counter(&status, counters::NODES_CREATED)
            + counter(&status, counters::NODES_REPLACED)
            + counter(&status, counters::NODES_SKIPPED),
        19
    );
}

// ============================================================================
// Batching
// ============================================================================

#[test]
fn test_heavy_item_is_batched_alone() {
    let store = Arc::new(FlakyStore::new());
    store.memory().create_folder_path("import").unwrap();
    let importer = BulkImporter::new(store.clone(), config(100, 1_000));
    let source = ScriptedSource::new("weights")
        .with_file(fixtures::weighted_file("A", 150))
        .with_file(fixtures::weighted_file("B", 10))
        .with_file(fixtures::weighted_file("C", 95));

    importer
        .start_with_source(Arc::new(source), ImportParameters::new(), "import")
        .unwrap();
    importer.await_completion().unwrap();

    assert!(importer.status().succeeded());
    let created: Vec<Vec<String>> = store.txn_log().into_iter().map(|t| t.created).collect();
    assert_eq!(
        created,
        vec![vec!["A".to_string()], vec!["B".to_string()], vec!["C".to_string()]]
    );
    assert_eq!(counter(&importer.status(), counters::BATCHES_SUBMITTED), 3);
}

#[test]
fn test_in_place_source_links_content() {
    let store = memory_store();
    let importer = BulkImporter::new(store.clone(), config(100, 3));
    let source = ScriptedSource::new("in-place").with_in_place().with_file(
        bulkimport::Item::file(None, "big.bin").with_version(
            bulkimport::Version::head()
                .with_content(bulkimport::ContentRef::file("/content/big.bin", 4096, true)),
        ),
    );

    importer
        .start_with_source(Arc::new(source), ImportParameters::new(), "import")
        .unwrap();
    importer.await_completion().unwrap();

    let status = importer.status();
    assert!(status.succeeded());
    assert!(status.in_place_import_possible());
    assert_eq!(counter(&status, counters::IN_PLACE_CONTENT_LINKED), 1);
    assert_eq!(counter(&status, counters::CONTENT_STREAMED), 0);
    assert_eq!(counter(&status, counters::BYTES_IMPORTED), 4096);
    let node = store.node_at("import/big.bin").unwrap();
    assert_eq!(node.content.map(|c| c.size()), Some(4096));
}
