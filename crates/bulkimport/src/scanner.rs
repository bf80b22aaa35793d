//! Producer side of the engine: drives one job end to end.
//!
//! The scanner asks the source for folders, then files, and cuts the stream
//! of submitted items into weight-bounded batches. The first batches are
//! imported on the scanning thread itself; once enough of them have landed
//! (and, by default, once the folder phase is over) the job switches for good
//! to the worker pool. After scanning, the scanner waits for the pool to
//! drain, shuts it down, and classifies the outcome.

use crate::backoff::RetryBackoff;
use crate::batch::Batch;
use crate::cancel::CancellationToken;
use crate::config::{ImportConfig, ImportParameters};
use crate::counters::BatchTally;
use crate::error::{panic_message, ImportError, Result};
use crate::importer::{BatchImporter, BatchOutcome};
use crate::model::Item;
use crate::pauser::Pauser;
use crate::pool::{ImportPool, PoolConfig, PoolFactory, Task};
use crate::source::{ImportCallback, Source};
use crate::status::ImportStatus;
use crate::util::human_duration;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Scanner tuning, derived from [`ImportConfig`].
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub batch_weight: u64,
    pub multithreading_threshold: u64,
    pub single_threaded_folder_phase: bool,
    pub status_log_interval: Duration,
    pub drain_poll_interval: Duration,
    pub max_out_of_order_retries: u32,
    pub out_of_order_backoff: RetryBackoff,
    pub pool: PoolConfig,
}

impl From<&ImportConfig> for ScanSettings {
    fn from(config: &ImportConfig) -> Self {
        Self {
            batch_weight: config.batch_weight,
            multithreading_threshold: config.multithreading_threshold,
            single_threaded_folder_phase: config.single_threaded_folder_phase,
            status_log_interval: config.status_log_interval(),
            drain_poll_interval: config.drain_poll_interval(),
            max_out_of_order_retries: config.max_out_of_order_retries,
            out_of_order_backoff: config.out_of_order_backoff(),
            pool: config.pool_config(),
        }
    }
}

/// Handles shared between the controller, the scanner, and the workers.
#[derive(Clone)]
pub struct JobControl {
    pub status: Arc<ImportStatus>,
    pub pauser: Pauser,
    pub cancel: CancellationToken,
}

/// Weight-bounded batch accumulation.
#[derive(Debug, Default)]
struct Accumulator {
    items: Vec<Item>,
    weight: u64,
    last_number: u64,
}

impl Accumulator {
    /// Add `item`, first cutting the current batch if the item would push it
    /// over `cap`. An item heavier than `cap` still gets a batch of its own.
    fn add(&mut self, item: Item, cap: u64) -> Result<Option<Batch>> {
        let weight = item.weight();
        let full = if !self.items.is_empty() && self.weight.saturating_add(weight) > cap {
            self.cut()?
        } else {
            None
        };
        self.items.push(item);
        self.weight = self.weight.saturating_add(weight);
        Ok(full)
    }

    /// Close the current batch, if it has anything in it.
    fn cut(&mut self) -> Result<Option<Batch>> {
        if self.items.is_empty() {
            return Ok(None);
        }
        let items = mem::take(&mut self.items);
        self.weight = 0;
        self.last_number += 1;
        Batch::new(self.last_number, items).map(Some)
    }
}

/// Position of a batch in its out-of-order retry budget.
///
/// The budget only runs down while no other batch commits: a parent that is
/// merely slow keeps the job alive, one that never arrives fails it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Attempt {
    number: u32,
    /// Job-wide commit count when the budget was last checked.
    committed_seen: u64,
}

/// Imports batches and interprets their outcomes; shared with pool tasks.
struct BatchRunner {
    importer: BatchImporter,
    status: Arc<ImportStatus>,
    cancel: CancellationToken,
    max_attempts: u32,
    backoff: RetryBackoff,
    committed: AtomicU64,
}

impl BatchRunner {
    fn first_attempt(&self) -> Attempt {
        Attempt {
            number: 1,
            committed_seen: self.committed.load(Ordering::SeqCst),
        }
    }

    fn task(self: &Arc<Self>, batch: Batch, attempt: Attempt) -> Task {
        let runner = Arc::clone(self);
        Task::new(batch.to_string(), move || runner.run_in_worker(batch, attempt))
    }

    /// Body of a pool task. Returns the requeued attempt for an out-of-order batch.
    fn run_in_worker(self: &Arc<Self>, batch: Batch, attempt: Attempt) -> Option<Task> {
        if self.cancel.is_cancelled() {
            debug!(batch = batch.number(), "Job cancelled; skipping queued batch");
            return None;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| self.importer.import_batch(&batch)));
        match outcome {
            Ok(BatchOutcome::Imported(tally)) => {
                self.completed(&batch, &tally);
                None
            }
            Ok(BatchOutcome::OutOfOrder { missing_parent }) => {
                match self.out_of_order(&batch, attempt, missing_parent) {
                    Ok(next) => Some(self.task(batch, next)),
                    Err(e) => {
                        self.fail(e);
                        None
                    }
                }
            }
            Ok(BatchOutcome::Interrupted) => None,
            Ok(BatchOutcome::Failed(e)) => {
                self.fail(e);
                None
            }
            Err(payload) => {
                self.fail(ImportError::Panic(format!(
                    "{}: {}",
                    batch,
                    panic_message(payload.as_ref())
                )));
                None
            }
        }
    }

    /// Import on the calling thread, retrying out-of-order attempts in place.
    fn run_inline(&self, batch: &Batch, pauser: &Pauser) -> Result<()> {
        let mut attempt = self.first_attempt();
        loop {
            pauser.block_if_paused(&self.cancel)?;
            self.cancel.check("starting a batch")?;
            match self.importer.import_batch(batch) {
                BatchOutcome::Imported(tally) => {
                    self.completed(batch, &tally);
                    return Ok(());
                }
                BatchOutcome::OutOfOrder { missing_parent } => {
                    attempt = self.out_of_order(batch, attempt, missing_parent)?;
                }
                BatchOutcome::Interrupted => {
                    return Err(ImportError::Interrupted(format!("importing {}", batch)));
                }
                BatchOutcome::Failed(e) => return Err(e),
            }
        }
    }

    fn completed(&self, batch: &Batch, tally: &BatchTally) {
        self.committed.fetch_add(1, Ordering::SeqCst);
        self.status.batch_completed(batch, tally);
    }

    /// Allow a retry of `batch` after a backoff, or give up once its budget
    /// is spent. Any commit elsewhere since the last check restarts the budget.
    fn out_of_order(&self, batch: &Batch, attempt: Attempt, missing_parent: String) -> Result<Attempt> {
        let committed = self.committed.load(Ordering::SeqCst);
        let number = if committed == attempt.committed_seen {
            attempt.number
        } else {
            if attempt.number > 1 {
                debug!(
                    batch = batch.number(),
                    attempts = attempt.number,
                    "Other batches committed since the last attempt; retry budget restarted"
                );
            }
            1
        };
        if number >= self.max_attempts {
            return Err(ImportError::OutOfOrderRetriesExhausted {
                batch: batch.number(),
                attempts: number,
                missing_parent,
            });
        }

        let delay = self.backoff.delay(number);
        warn!(
            batch = batch.number(),
            attempt = number,
            missing_parent = %missing_parent,
            backoff_ms = delay.as_millis() as u64,
            "Batch is out of order; rolled back and requeued"
        );
        self.status.batch_requeued();
        self.cancel.sleep(delay, "backing off an out-of-order batch")?;
        Ok(Attempt {
            number: number + 1,
            committed_seen: committed,
        })
    }

    /// Record a job-fatal error from a worker and cancel the job.
    fn fail(&self, err: ImportError) {
        if self.cancel.is_cancelled() || self.status.is_stopping() {
            debug!(error = %err, "Ignoring error raised after the job was cancelled");
            return;
        }
        self.status.unexpected_error(err);
        self.cancel.cancel();
    }
}

/// Drives one import job; see the module docs.
pub struct Scanner {
    source: Arc<dyn Source>,
    params: ImportParameters,
    status: Arc<ImportStatus>,
    pauser: Pauser,
    cancel: CancellationToken,
    settings: ScanSettings,
    pool_factory: PoolFactory,
    runner: Arc<BatchRunner>,
    accumulator: Mutex<Accumulator>,
    inline_completed: AtomicU64,
    folder_phase_done: AtomicBool,
    multithreaded: AtomicBool,
    pool: Mutex<Option<Arc<ImportPool>>>,
}

impl Scanner {
    pub fn new(
        source: Arc<dyn Source>,
        params: ImportParameters,
        importer: BatchImporter,
        control: JobControl,
        settings: ScanSettings,
        pool_factory: PoolFactory,
    ) -> Self {
        let runner = Arc::new(BatchRunner {
            importer,
            status: Arc::clone(&control.status),
            cancel: control.cancel.clone(),
            max_attempts: settings.max_out_of_order_retries.max(1),
            backoff: settings.out_of_order_backoff,
            committed: AtomicU64::new(0),
        });
        Self {
            source,
            params,
            status: control.status,
            pauser: control.pauser,
            cancel: control.cancel,
            settings,
            pool_factory,
            runner,
            accumulator: Mutex::new(Accumulator::default()),
            inline_completed: AtomicU64::new(0),
            folder_phase_done: AtomicBool::new(false),
            multithreaded: AtomicBool::new(false),
            pool: Mutex::new(None),
        }
    }

    /// Run the job to completion. Every outcome is reflected in status.
    pub fn run(&self) {
        let source = self.source.name().to_string();
        info!(source = %source, "Import started");

        let result = catch_unwind(AssertUnwindSafe(|| self.scan_and_import())).unwrap_or_else(|payload| {
            Err(ImportError::Panic(format!(
                "scanner: {}",
                panic_message(payload.as_ref())
            )))
        });
        if let Err(e) = result {
            if self.status.is_stopping() || (e.is_interruption() && self.cancel.is_cancelled()) {
                debug!(source = %source, error = %e, "Scanner interrupted");
            } else {
                self.status.unexpected_error(e);
            }
            self.cancel.cancel();
            self.abandon_pool();
        }

        self.status.import_complete();
        info!(
            source = %source,
            state = %self.status.processing_state(),
            duration = %self.status.duration().map(human_duration).unwrap_or_default(),
            "Import finished"
        );
    }

    fn scan_and_import(&self) -> Result<()> {
        self.source.init(&self.status, &self.params)?;
        let in_place = self.source.in_place_import_possible();
        self.status.set_in_place_import(in_place);
        info!(
            mode = if in_place { "in-place" } else { "streaming" },
            batch_weight = self.settings.batch_weight,
            "Import mode selected"
        );
        self.maybe_go_multithreaded();

        // Phase 1: folders
        self.source.scan_folders(&self.status, self)?;
        self.flush()?;
        self.folder_phase_done.store(true, Ordering::SeqCst);
        self.maybe_go_multithreaded();
        debug!(
            elapsed = %self.status.duration().map(human_duration).unwrap_or_default(),
            "Folder scan complete"
        );

        // Phase 2: files
        self.source.scan_files(&self.status, self)?;
        self.flush()?;
        self.status.scanning_complete();
        debug!(
            elapsed = %self.status.duration().map(human_duration).unwrap_or_default(),
            "File scan complete"
        );

        // Phase 3: drain and shut down
        self.await_drain()?;
        if let Some(pool) = self.take_pool() {
            pool.shutdown();
            pool.await_termination();
            debug!("Import pool shut down");
        }
        Ok(())
    }

    /// True once the job has switched to the worker pool.
    pub fn is_multithreaded(&self) -> bool {
        self.multithreaded.load(Ordering::SeqCst)
    }

    fn flush(&self) -> Result<()> {
        let batch = self.lock_accumulator().cut()?;
        match batch {
            Some(batch) => {
                self.status.batch_submitted();
                self.dispatch(batch)
            }
            None => Ok(()),
        }
    }

    fn dispatch(&self, batch: Batch) -> Result<()> {
        if self.is_multithreaded() {
            let pool = self.pool()?;
            let attempt = self.runner.first_attempt();
            return pool.execute(self.runner.task(batch, attempt));
        }

        self.runner.run_inline(&batch, &self.pauser)?;
        self.inline_completed.fetch_add(1, Ordering::SeqCst);
        self.maybe_go_multithreaded();
        Ok(())
    }

    fn maybe_go_multithreaded(&self) {
        if self.is_multithreaded() {
            return;
        }
        let completed = self.inline_completed.load(Ordering::SeqCst);
        let folders_done =
            self.folder_phase_done.load(Ordering::SeqCst) || !self.settings.single_threaded_folder_phase;
        if completed >= self.settings.multithreading_threshold && folders_done {
            self.multithreaded.store(true, Ordering::SeqCst);
            info!(
                inline_batches = completed,
                pool_size = self.settings.pool.pool_size,
                "Switching to multi-threaded import"
            );
        }
    }

    fn pool(&self) -> Result<Arc<ImportPool>> {
        let mut slot = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new((self.pool_factory)(
            &self.settings.pool,
            self.pauser.clone(),
            self.cancel.clone(),
        )?);
        self.status.attach_pool(pool.monitor());
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    fn current_pool(&self) -> Option<Arc<ImportPool>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn take_pool(&self) -> Option<Arc<ImportPool>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn abandon_pool(&self) {
        if let Some(pool) = self.take_pool() {
            let dropped = pool.shutdown_now();
            debug!(dropped, "Forcibly shutting down import pool and awaiting in-flight batches");
            pool.await_termination();
        }
    }

    fn await_drain(&self) -> Result<()> {
        let Some(pool) = self.current_pool() else {
            return Ok(());
        };
        let monitor = pool.monitor();
        let mut last_report = Instant::now();
        while !monitor.is_drained() {
            self.cancel.check("waiting for queued batches")?;
            if last_report.elapsed() >= self.settings.status_log_interval {
                self.log_progress();
                last_report = Instant::now();
            }
            thread::sleep(self.settings.drain_poll_interval);
        }
        Ok(())
    }

    fn log_progress(&self) {
        let per_second = self
            .status
            .target_counter_rate(crate::counters::BATCHES_COMPLETED, Duration::from_secs(1))
            .unwrap_or(0.0);
        let eta = self
            .status
            .estimated_remaining_duration()
            .map(human_duration)
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            batches_in_progress = self.status.batches_in_progress(),
            queued = self.status.queue_size(),
            active = self.status.active_threads(),
            batches_per_second = per_second,
            remaining = %eta,
            "Import in progress"
        );
    }

    fn lock_accumulator(&self) -> MutexGuard<'_, Accumulator> {
        self.accumulator.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ImportCallback for Scanner {
    /// Accumulation state is updated under one lock; the resulting batch is
    /// dispatched after the lock is released. Sources call this from a
    /// single thread, so dispatch order follows batch numbers.
    fn submit(&self, item: Item) -> Result<()> {
        self.cancel.check("scanning")?;
        item.validate()?;
        let full = self.lock_accumulator().add(item, self.settings.batch_weight)?;
        if let Some(batch) = full {
            self.status.batch_submitted();
            self.dispatch(batch)?;
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
