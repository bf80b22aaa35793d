//! Hooks invoked once a job has reached a terminal state.

use crate::counters;
use crate::status::ImportStatus;
use crate::util::{human_bytes, human_duration};
use std::time::Duration;
use tracing::{info, warn};

/// Called on the scanning thread after the job's terminal state is recorded.
pub trait CompletionHandler: Send + Sync {
    fn import_complete(&self, status: &ImportStatus);
}

/// Logs a one-shot summary of the finished job.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCompletionHandler;

impl LoggingCompletionHandler {
    pub fn summary(status: &ImportStatus) -> String {
        let count = |name: &str| status.target_counter(name).unwrap_or(0);
        let per_second = |name: &str| {
            status
                .target_counter_rate(name, Duration::from_secs(1))
                .unwrap_or(0.0)
        };
        let bytes = count(counters::BYTES_IMPORTED).max(0) as u64;

        let mut summary = format!(
            "Bulk import from '{}' {} in {}.\n",
            status.source_name().unwrap_or_default(),
            status.processing_state().label().to_lowercase(),
            status.duration().map(human_duration).unwrap_or_default()
        );
        summary.push_str(&format!(
            "Batches: {} submitted, {} completed, {} requeued\n",
            count(counters::BATCHES_SUBMITTED),
            count(counters::BATCHES_COMPLETED),
            count(counters::BATCHES_REQUEUED)
        ));
        summary.push_str(&format!(
            "Nodes: {} imported ({:.2}/s), {} created, {} replaced, {} skipped\n",
            count(counters::NODES_IMPORTED),
            per_second(counters::NODES_IMPORTED),
            count(counters::NODES_CREATED),
            count(counters::NODES_REPLACED),
            count(counters::NODES_SKIPPED)
        ));
        summary.push_str(&format!(
            "Content: {} ({:.2} bytes/s), {} streamed, {} linked in place\n",
            human_bytes(bytes),
            per_second(counters::BYTES_IMPORTED),
            count(counters::CONTENT_STREAMED),
            count(counters::IN_PLACE_CONTENT_LINKED)
        ));
        summary.push_str(&format!(
            "Metadata: {} versions, {} aspects, {} properties",
            count(counters::VERSIONS_IMPORTED),
            count(counters::ASPECTS_ASSOCIATED),
            count(counters::METADATA_PROPERTIES_IMPORTED)
        ));
        if status.is_dry_run() {
            summary.push_str("\n[DRY RUN] Nothing was written to the target.");
        }
        summary
    }
}

impl CompletionHandler for LoggingCompletionHandler {
    fn import_complete(&self, status: &ImportStatus) {
        let summary = Self::summary(status);
        match status.last_error() {
            Some(err) if status.failed() => {
                warn!(error = %err, "{}", summary);
            }
            _ => info!("{}", summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::JobDescriptor;
    use uuid::Uuid;

    #[test]
    fn test_summary_mentions_state_and_counts() {
        let status = ImportStatus::new();
        status
            .import_started(JobDescriptor {
                job_id: Uuid::new_v4(),
                source_name: "sample".to_string(),
                target_path: "import".to_string(),
                batch_weight: 100,
                dry_run: true,
                replace_existing: false,
            })
            .unwrap();
        status.add_to_target_counter(counters::NODES_CREATED, 12);
        status.add_to_target_counter(counters::NODES_IMPORTED, 12);
        status.import_complete();

        let summary = LoggingCompletionHandler::summary(&status);
        assert!(summary.starts_with("Bulk import from 'sample' succeeded in"));
        assert!(summary.contains("12 imported"));
        assert!(summary.contains("12 created"));
        assert!(summary.contains("[DRY RUN]"));

        LoggingCompletionHandler.import_complete(&status);
    }
}
