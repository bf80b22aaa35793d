//! Live job state, shared by the scanner, every worker, and any poller.
//!
//! One [`ImportStatus`] exists per controller and is reset when a job starts.
//! Writers never block readers for longer than a field copy; counters are
//! atomics.

use crate::batch::Batch;
use crate::counters::{self, BatchTally, CounterSet};
use crate::error::{ImportError, Result};
use crate::pool::PoolMonitor;
use crate::util::human_duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error};
use uuid::Uuid;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    NeverRun,
    Scanning,
    Importing,
    Paused,
    Stopping,
    Succeeded,
    Failed,
    Stopped,
}

impl ProcessingState {
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            ProcessingState::Scanning
                | ProcessingState::Importing
                | ProcessingState::Paused
                | ProcessingState::Stopping
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProcessingState::NeverRun => "Never run",
            ProcessingState::Scanning => "Scanning",
            ProcessingState::Importing => "Importing",
            ProcessingState::Paused => "Paused",
            ProcessingState::Stopping => "Stopping",
            ProcessingState::Succeeded => "Succeeded",
            ProcessingState::Failed => "Failed",
            ProcessingState::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fixed facts about a job, recorded when it starts.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub job_id: Uuid,
    pub source_name: String,
    pub target_path: String,
    pub batch_weight: u64,
    pub dry_run: bool,
    pub replace_existing: bool,
}

#[derive(Debug, Clone, Copy)]
struct Timestamp {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Timestamp {
    fn now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ProcessingState,
    prior_state: Option<ProcessingState>,
    job: Option<JobDescriptor>,
    in_place_import: bool,
    started: Option<Timestamp>,
    scan_ended: Option<Timestamp>,
    ended: Option<Timestamp>,
    last_error: Option<Arc<ImportError>>,
    last_error_at: Option<DateTime<Utc>>,
    currently_scanning: Option<String>,
    currently_importing: Option<String>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: ProcessingState::NeverRun,
            prior_state: None,
            job: None,
            in_place_import: false,
            started: None,
            scan_ended: None,
            ended: None,
            last_error: None,
            last_error_at: None,
            currently_scanning: None,
            currently_importing: None,
        }
    }
}

/// Concurrency-safe state machine and counters for the current (or last) job.
#[derive(Debug, Default)]
pub struct ImportStatus {
    in_progress: AtomicBool,
    inner: RwLock<Inner>,
    source_counters: CounterSet,
    target_counters: CounterSet,
    pool: RwLock<Option<PoolMonitor>>,
}

impl ImportStatus {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Claim the status for a new job and reset everything.
    ///
    /// Fails with a state conflict if a job is already in progress.
    pub fn import_started(&self, job: JobDescriptor) -> Result<()> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ImportError::StateConflict(
                "An import is already in progress.".to_string(),
            ));
        }

        self.source_counters.clear();
        self.target_counters.clear();
        self.target_counters.preregister(counters::DEFAULT_TARGET_COUNTERS);
        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = None;

        let mut inner = self.write();
        *inner = Inner {
            state: ProcessingState::Scanning,
            job: Some(job),
            started: Some(Timestamp::now()),
            ..Inner::default()
        };
        Ok(())
    }

    pub fn set_in_place_import(&self, in_place: bool) {
        self.write().in_place_import = in_place;
    }

    pub fn attach_pool(&self, monitor: PoolMonitor) {
        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(monitor);
    }

    /// Both scan phases are done; only queued batches remain.
    pub fn scanning_complete(&self) {
        let mut inner = self.write();
        inner.scan_ended = Some(Timestamp::now());
        inner.currently_scanning = None;
        match inner.state {
            ProcessingState::Scanning => inner.state = ProcessingState::Importing,
            ProcessingState::Paused => inner.prior_state = Some(ProcessingState::Importing),
            _ => {}
        }
    }

    pub fn pause_requested(&self) -> Result<()> {
        let mut inner = self.write();
        match inner.state {
            ProcessingState::Scanning | ProcessingState::Importing => {
                inner.prior_state = Some(inner.state);
                inner.state = ProcessingState::Paused;
                Ok(())
            }
            ProcessingState::Paused => Err(ImportError::StateConflict(
                "Import is already paused.".to_string(),
            )),
            ProcessingState::Stopping => Err(ImportError::StateConflict(
                "Import is stopping.".to_string(),
            )),
            _ => Err(ImportError::StateConflict("No import in progress.".to_string())),
        }
    }

    pub fn resume_requested(&self) -> Result<()> {
        let mut inner = self.write();
        if inner.state != ProcessingState::Paused {
            return Err(ImportError::StateConflict("Import is not paused.".to_string()));
        }
        inner.state = inner.prior_state.take().unwrap_or(ProcessingState::Importing);
        Ok(())
    }

    pub fn stop_requested(&self) -> Result<()> {
        let mut inner = self.write();
        match inner.state {
            ProcessingState::Stopping => Err(ImportError::StateConflict(
                "Import is already stopping.".to_string(),
            )),
            state if state.is_in_progress() => {
                inner.prior_state = None;
                inner.state = ProcessingState::Stopping;
                Ok(())
            }
            _ => Err(ImportError::StateConflict("No import in progress.".to_string())),
        }
    }

    /// Record a job-fatal error; the job ends FAILED unless it was stopping.
    pub fn unexpected_error(&self, err: ImportError) {
        error!(error = %err, "Bulk import failed");
        let mut inner = self.write();
        inner.last_error = Some(Arc::new(err));
        inner.last_error_at = Some(Utc::now());
    }

    /// Classify and release the status. Call exactly once per job.
    pub fn import_complete(&self) {
        {
            let mut inner = self.write();
            inner.ended = Some(Timestamp::now());
            inner.currently_scanning = None;
            inner.currently_importing = None;
            inner.prior_state = None;
            inner.state = if inner.state == ProcessingState::Stopping {
                ProcessingState::Stopped
            } else if inner.last_error.is_some() {
                ProcessingState::Failed
            } else {
                ProcessingState::Succeeded
            };
            debug!(state = %inner.state, "Import complete");
        }
        self.in_progress.store(false, Ordering::SeqCst);
    }

    pub fn set_currently_scanning(&self, what: Option<String>) {
        self.write().currently_scanning = what;
    }

    pub fn set_currently_importing(&self, what: Option<String>) {
        self.write().currently_importing = what;
    }

    /// Clear the importing marker unless another batch has taken it since.
    pub fn finished_importing(&self, what: &str) {
        let mut inner = self.write();
        if inner.currently_importing.as_deref() == Some(what) {
            inner.currently_importing = None;
        }
    }

    pub fn batch_submitted(&self) {
        self.target_counters.increment(counters::BATCHES_SUBMITTED);
    }

    pub fn batch_requeued(&self) {
        self.target_counters.increment(counters::BATCHES_REQUEUED);
    }

    /// Apply a committed batch's tally.
    pub fn batch_completed(&self, batch: &Batch, tally: &BatchTally) {
        tally.apply_to(&self.target_counters);
        self.target_counters.increment(counters::BATCHES_COMPLETED);
        debug!(
            batch = batch.number(),
            nodes = tally.nodes_processed(),
            bytes = tally.bytes_imported,
            "Batch committed"
        );
    }

    pub fn preregister_source_counters(&self, names: &[&str]) {
        self.source_counters.preregister(names);
    }

    pub fn increment_source_counter(&self, name: &str) {
        self.source_counters.increment(name);
    }

    pub fn add_to_source_counter(&self, name: &str, value: i64) {
        self.source_counters.add(name, value);
    }

    pub fn preregister_target_counters(&self, names: &[&str]) {
        self.target_counters.preregister(names);
    }

    pub fn increment_target_counter(&self, name: &str) {
        self.target_counters.increment(name);
    }

    pub fn add_to_target_counter(&self, name: &str, value: i64) {
        self.target_counters.add(name, value);
    }

    // ========================================================================
    // Read API
    // ========================================================================

    pub fn processing_state(&self) -> ProcessingState {
        self.read().state
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        self.read().state == ProcessingState::Scanning
    }

    pub fn is_paused(&self) -> bool {
        self.read().state == ProcessingState::Paused
    }

    pub fn is_stopping(&self) -> bool {
        self.read().state == ProcessingState::Stopping
    }

    pub fn succeeded(&self) -> bool {
        self.read().state == ProcessingState::Succeeded
    }

    pub fn failed(&self) -> bool {
        self.read().state == ProcessingState::Failed
    }

    pub fn stopped(&self) -> bool {
        self.read().state == ProcessingState::Stopped
    }

    /// Scan phases finished (queued batches may still be importing).
    pub fn is_scan_complete(&self) -> bool {
        self.read().scan_ended.is_some()
    }

    pub fn job_id(&self) -> Option<Uuid> {
        self.read().job.as_ref().map(|j| j.job_id)
    }

    pub fn source_name(&self) -> Option<String> {
        self.read().job.as_ref().map(|j| j.source_name.clone())
    }

    pub fn target_path(&self) -> Option<String> {
        self.read().job.as_ref().map(|j| j.target_path.clone())
    }

    pub fn batch_weight(&self) -> u64 {
        self.read().job.as_ref().map_or(0, |j| j.batch_weight)
    }

    pub fn is_dry_run(&self) -> bool {
        self.read().job.as_ref().map_or(false, |j| j.dry_run)
    }

    pub fn is_replace_existing(&self) -> bool {
        self.read().job.as_ref().map_or(false, |j| j.replace_existing)
    }

    pub fn in_place_import_possible(&self) -> bool {
        self.read().in_place_import
    }

    pub fn currently_scanning(&self) -> Option<String> {
        self.read().currently_scanning.clone()
    }

    pub fn currently_importing(&self) -> Option<String> {
        self.read().currently_importing.clone()
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.read().started.map(|t| t.wall)
    }

    pub fn scan_end_date(&self) -> Option<DateTime<Utc>> {
        self.read().scan_ended.map(|t| t.wall)
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.read().ended.map(|t| t.wall)
    }

    /// Time from start to end, or to now while running.
    pub fn duration(&self) -> Option<Duration> {
        let inner = self.read();
        let start = inner.started?;
        let end = inner.ended.map_or_else(Instant::now, |t| t.mono);
        Some(end.saturating_duration_since(start.mono))
    }

    /// Time spent scanning, or so far while the scan is still running.
    pub fn scan_duration(&self) -> Option<Duration> {
        let inner = self.read();
        let start = inner.started?;
        let end = inner
            .scan_ended
            .or(inner.ended)
            .map_or_else(Instant::now, |t| t.mono);
        Some(end.saturating_duration_since(start.mono))
    }

    pub fn last_error(&self) -> Option<Arc<ImportError>> {
        self.read().last_error.clone()
    }

    pub fn last_error_at(&self) -> Option<DateTime<Utc>> {
        self.read().last_error_at
    }

    pub fn source_counter(&self, name: &str) -> Option<i64> {
        self.source_counters.get(name)
    }

    pub fn source_counter_names(&self) -> Vec<String> {
        self.source_counters.names()
    }

    pub fn target_counter(&self, name: &str) -> Option<i64> {
        self.target_counters.get(name)
    }

    pub fn target_counter_names(&self) -> Vec<String> {
        self.target_counters.names()
    }

    /// Source counter per `unit` of elapsed time (e.g. per second).
    pub fn source_counter_rate(&self, name: &str, unit: Duration) -> Option<f64> {
        rate(self.source_counter(name)?, self.duration()?, unit)
    }

    /// Target counter per `unit` of elapsed time (e.g. per second).
    pub fn target_counter_rate(&self, name: &str, unit: Duration) -> Option<f64> {
        rate(self.target_counter(name)?, self.duration()?, unit)
    }

    pub fn queue_size(&self) -> usize {
        self.pool_monitor().map_or(0, |p| p.queue_size())
    }

    pub fn queue_capacity(&self) -> usize {
        self.pool_monitor().map_or(0, |p| p.queue_capacity())
    }

    pub fn active_threads(&self) -> usize {
        self.pool_monitor().map_or(0, |p| p.active_count())
    }

    pub fn pool_size(&self) -> usize {
        self.pool_monitor().map_or(0, |p| p.pool_size())
    }

    /// Batches queued or running in the pool.
    pub fn batches_in_progress(&self) -> usize {
        self.pool_monitor()
            .map_or(0, |p| p.queue_size() + p.active_count())
    }

    /// Remaining time at the observed completion rate.
    ///
    /// Only known once scanning has finished and the job is not paused.
    pub fn estimated_remaining_duration(&self) -> Option<Duration> {
        if !self.is_in_progress() || !self.is_scan_complete() || self.is_paused() {
            return None;
        }
        let remaining = self.batches_in_progress() as f64;
        let per_second = self.target_counter_rate(counters::BATCHES_COMPLETED, Duration::from_secs(1))?;
        if per_second <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining / per_second))
    }

    /// Serializable point-in-time copy for reporting.
    pub fn snapshot(&self) -> StatusSnapshot {
        let target_counters = self.target_counters.snapshot();
        let per_second = Duration::from_secs(1);
        let target_rates = target_counters
            .keys()
            .filter_map(|name| {
                self.target_counter_rate(name, per_second)
                    .map(|r| (name.clone(), r))
            })
            .collect();
        let inner = self.read();
        let job = inner.job.clone();
        let last_error = inner.last_error.as_ref().map(|e| e.to_string());
        let snapshot = StatusSnapshot {
            job_id: job.as_ref().map(|j| j.job_id),
            state: inner.state,
            in_progress: inner.state.is_in_progress(),
            source_name: job.as_ref().map(|j| j.source_name.clone()),
            target_path: job.as_ref().map(|j| j.target_path.clone()),
            batch_weight: job.as_ref().map_or(0, |j| j.batch_weight),
            dry_run: job.as_ref().map_or(false, |j| j.dry_run),
            replace_existing: job.as_ref().map_or(false, |j| j.replace_existing),
            in_place_import: inner.in_place_import,
            start_date: inner.started.map(|t| t.wall),
            scan_end_date: inner.scan_ended.map(|t| t.wall),
            end_date: inner.ended.map(|t| t.wall),
            currently_scanning: inner.currently_scanning.clone(),
            currently_importing: inner.currently_importing.clone(),
            last_error,
            last_error_at: inner.last_error_at,
            source_counters: self.source_counters.snapshot(),
            target_counters,
            target_rates_per_second: target_rates,
            duration_ms: None,
            estimated_remaining_ms: None,
            queue_size: 0,
            active_threads: 0,
            pool_size: 0,
        };
        drop(inner);

        StatusSnapshot {
            duration_ms: self.duration().map(|d| d.as_millis() as u64),
            estimated_remaining_ms: self
                .estimated_remaining_duration()
                .map(|d| d.as_millis() as u64),
            queue_size: self.queue_size(),
            active_threads: self.active_threads(),
            pool_size: self.pool_size(),
            ..snapshot
        }
    }

    fn pool_monitor(&self) -> Option<PoolMonitor> {
        self.pool.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn rate(value: i64, elapsed: Duration, unit: Duration) -> Option<f64> {
    if elapsed.is_zero() {
        return None;
    }
    Some(value as f64 * unit.as_secs_f64() / elapsed.as_secs_f64())
}

/// Point-in-time copy of [`ImportStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub job_id: Option<Uuid>,
    pub state: ProcessingState,
    pub in_progress: bool,
    pub source_name: Option<String>,
    pub target_path: Option<String>,
    pub batch_weight: u64,
    pub dry_run: bool,
    pub replace_existing: bool,
    pub in_place_import: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub scan_end_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub estimated_remaining_ms: Option<u64>,
    pub currently_scanning: Option<String>,
    pub currently_importing: Option<String>,
    pub queue_size: usize,
    pub active_threads: usize,
    pub pool_size: usize,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub source_counters: BTreeMap<String, i64>,
    pub target_counters: BTreeMap<String, i64>,
    pub target_rates_per_second: BTreeMap<String, f64>,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "State:           {}", self.state)?;
        if let Some(source) = &self.source_name {
            writeln!(f, "Source:          {}", source)?;
        }
        if let Some(target) = &self.target_path {
            writeln!(f, "Target:          {}", target)?;
        }
        writeln!(
            f,
            "Mode:            {}{}",
            if self.in_place_import { "in-place" } else { "streaming" },
            if self.dry_run { " (dry run)" } else { "" }
        )?;
        if let Some(ms) = self.duration_ms {
            writeln!(f, "Duration:        {}", human_duration(Duration::from_millis(ms)))?;
        }
        if let Some(ms) = self.estimated_remaining_ms {
            writeln!(f, "Remaining (est): {}", human_duration(Duration::from_millis(ms)))?;
        }
        if let Some(err) = &self.last_error {
            writeln!(f, "Last error:      {}", err)?;
        }
        if !self.source_counters.is_empty() {
            writeln!(f, "Source counters:")?;
            for (name, value) in &self.source_counters {
                writeln!(f, "  {:<30} {}", name, value)?;
            }
        }
        writeln!(f, "Target counters:")?;
        for (name, value) in &self.target_counters {
            match self.target_rates_per_second.get(name) {
                Some(rate) if *value > 0 => writeln!(f, "  {:<30} {} ({:.2}/s)", name, value, rate)?,
                _ => writeln!(f, "  {:<30} {}", name, value)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentRef, Item, Version};
    use std::thread;

    fn job() -> JobDescriptor {
        JobDescriptor {
            job_id: Uuid::new_v4(),
            source_name: "sample".to_string(),
            target_path: "import".to_string(),
            batch_weight: 100,
            dry_run: false,
            replace_existing: false,
        }
    }

    fn batch() -> Batch {
        let item = Item::file(None, "a.txt")
            .with_version(Version::head().with_content(ContentRef::bytes("a", b"abc".to_vec())));
        Batch::new(1, vec![item]).unwrap()
    }

    #[test]
    fn test_never_run_is_not_in_progress() {
        let status = ImportStatus::new();
        assert_eq!(status.processing_state(), ProcessingState::NeverRun);
        assert!(!status.is_in_progress());
        assert!(status.duration().is_none());
        assert!(status.estimated_remaining_duration().is_none());
    }

    #[test]
    fn test_start_is_compare_and_set() {
        let status = ImportStatus::new();
        status.import_started(job()).unwrap();
        let err = status.import_started(job()).unwrap_err();
        assert!(matches!(err, ImportError::StateConflict(_)));
        assert_eq!(status.processing_state(), ProcessingState::Scanning);
    }

    #[test]
    fn test_concurrent_start_has_one_winner() {
        let status = Arc::new(ImportStatus::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let status = Arc::clone(&status);
                thread::spawn(move || status.import_started(job()).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_start_resets_counters_and_preregisters_defaults() {
        let status = ImportStatus::new();
        status.import_started(job()).unwrap();
        status.increment_source_counter("Files synthesised");
        status.batch_completed(&batch(), &BatchTally { nodes_created: 1, ..Default::default() });
        status.import_complete();

        status.import_started(job()).unwrap();
        assert_eq!(status.source_counter("Files synthesised"), None);
        assert_eq!(status.target_counter(counters::NODES_CREATED), Some(0));
        assert_eq!(status.target_counter(counters::BATCHES_COMPLETED), Some(0));
        assert!(status.last_error().is_none());
    }

    #[test]
    fn test_pause_resume_restores_prior_state() {
        let status = ImportStatus::new();
        assert!(status.pause_requested().is_err());
        status.import_started(job()).unwrap();

        status.pause_requested().unwrap();
        assert!(status.is_paused());
        assert!(status.pause_requested().is_err());
        status.resume_requested().unwrap();
        assert_eq!(status.processing_state(), ProcessingState::Scanning);
        assert!(status.resume_requested().is_err());
    }

    #[test]
    fn test_scan_completing_while_paused_resumes_into_importing() {
        let status = ImportStatus::new();
        status.import_started(job()).unwrap();
        status.pause_requested().unwrap();
        status.scanning_complete();
        assert!(status.is_paused());
        status.resume_requested().unwrap();
        assert_eq!(status.processing_state(), ProcessingState::Importing);
    }

    #[test]
    fn test_terminal_classification() {
        let status = ImportStatus::new();
        status.import_started(job()).unwrap();
        status.scanning_complete();
        status.import_complete();
        assert!(status.succeeded());
        assert!(!status.is_in_progress());

        status.import_started(job()).unwrap();
        status.unexpected_error(ImportError::Source("disk gone".to_string()));
        status.import_complete();
        assert!(status.failed());
        assert!(status.last_error().unwrap().to_string().contains("disk gone"));

        status.import_started(job()).unwrap();
        status.stop_requested().unwrap();
        assert!(status.is_stopping());
        assert!(status.stop_requested().is_err());
        status.unexpected_error(ImportError::Source("late failure".to_string()));
        status.import_complete();
        assert!(status.stopped());
        assert!(status.stop_requested().is_err());
    }

    #[test]
    fn test_importing_marker_cleared_by_its_own_batch_only() {
        let status = ImportStatus::new();
        status.import_started(job()).unwrap();

        status.set_currently_importing(Some("Batch #1".to_string()));
        status.set_currently_importing(Some("Batch #2".to_string()));
        status.finished_importing("Batch #1");
        assert_eq!(status.currently_importing().as_deref(), Some("Batch #2"));

        status.finished_importing("Batch #2");
        assert_eq!(status.currently_importing(), None);
        assert_eq!(status.snapshot().currently_importing, None);
    }

    #[test]
    fn test_rates_and_snapshot() {
        let status = ImportStatus::new();
        status.import_started(job()).unwrap();
        status.batch_completed(
            &batch(),
            &BatchTally {
                nodes_created: 1,
                content_streamed: 1,
                bytes_imported: 3,
                ..Default::default()
            },
        );
        thread::sleep(Duration::from_millis(20));
        status.scanning_complete();
        status.import_complete();

        let per_second = status
            .target_counter_rate(counters::NODES_CREATED, Duration::from_secs(1))
            .unwrap();
        assert!(per_second > 0.0);
        assert!(status.target_counter_rate("missing", Duration::from_secs(1)).is_none());

        let snapshot = status.snapshot();
        assert_eq!(snapshot.state, ProcessingState::Succeeded);
        assert_eq!(snapshot.target_counters[counters::BYTES_IMPORTED], 3);
        assert!(snapshot.duration_ms.is_some());
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"SUCCEEDED\""));
        assert!(snapshot.to_string().contains("Nodes created"));
    }
}
