//! Job controller: the control surface of the engine.
//!
//! A [`BulkImporter`] owns the registered sources, the target store, and the
//! single [`ImportStatus`]. At most one job runs at a time; it runs on its own
//! scanner thread while the caller polls status or pauses, resumes, and stops.

use crate::cancel::CancellationToken;
use crate::completion::{CompletionHandler, LoggingCompletionHandler};
use crate::config::{ImportConfig, ImportParameters};
use crate::error::{panic_message, ImportError, Result};
use crate::importer::BatchImporter;
use crate::pauser::Pauser;
use crate::pool::{default_pool_factory, PoolFactory};
use crate::scanner::{JobControl, ScanSettings, Scanner};
use crate::source::Source;
use crate::status::{ImportStatus, JobDescriptor};
use crate::target::TargetStore;
use std::collections::BTreeMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use tracing::{error, info};
use uuid::Uuid;

struct RunningJob {
    job_id: Uuid,
    pauser: Pauser,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub struct BulkImporter {
    store: Arc<dyn TargetStore>,
    config: ImportConfig,
    status: Arc<ImportStatus>,
    sources: RwLock<BTreeMap<String, Arc<dyn Source>>>,
    pool_factory: PoolFactory,
    completion_handlers: Vec<Arc<dyn CompletionHandler>>,
    running: Mutex<Option<RunningJob>>,
}

impl BulkImporter {
    pub fn new(store: Arc<dyn TargetStore>, config: ImportConfig) -> Self {
        Self {
            store,
            config,
            status: Arc::new(ImportStatus::new()),
            sources: RwLock::new(BTreeMap::new()),
            pool_factory: default_pool_factory(),
            completion_handlers: Vec::new(),
            running: Mutex::new(None),
        }
    }

    /// Replace how worker pools are built (tests use this to observe pools).
    pub fn with_pool_factory(mut self, factory: PoolFactory) -> Self {
        self.pool_factory = factory;
        self
    }

    /// Handlers run in registration order, before the built-in summary log.
    pub fn with_completion_handler(mut self, handler: Arc<dyn CompletionHandler>) -> Self {
        self.completion_handlers.push(handler);
        self
    }

    pub fn register_source(&self, source: Arc<dyn Source>) {
        let name = source.name().to_string();
        info!(source = %name, description = %source.description(), "Registered import source");
        self.sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, source);
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn source(&self, name: &str) -> Option<Arc<dyn Source>> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn status(&self) -> Arc<ImportStatus> {
        Arc::clone(&self.status)
    }

    /// Start an import from a registered source into `target_path`.
    ///
    /// Returns once the scanner thread is running.
    pub fn start(&self, source_name: &str, params: ImportParameters, target_path: &str) -> Result<Uuid> {
        let source = self
            .source(source_name)
            .ok_or_else(|| ImportError::UnknownSource(source_name.to_string()))?;
        self.start_with_source(source, params, target_path)
    }

    pub fn start_with_source(
        &self,
        source: Arc<dyn Source>,
        params: ImportParameters,
        target_path: &str,
    ) -> Result<Uuid> {
        self.config.validate()?;
        let options = params.import_options()?;
        let target_path = target_path.trim();
        if target_path.is_empty() {
            return Err(ImportError::InvalidTarget(
                "a target path is required".to_string(),
            ));
        }
        let target = self
            .store
            .resolve_target(target_path)
            .map_err(|e| ImportError::InvalidTarget(format!("{}: {}", target_path, e)))?;

        let mut running = self.lock_running();
        let job_id = Uuid::new_v4();
        self.status.import_started(JobDescriptor {
            job_id,
            source_name: source.name().to_string(),
            target_path: target_path.to_string(),
            batch_weight: self.config.batch_weight,
            dry_run: options.dry_run,
            replace_existing: options.replace_existing,
        })?;

        // The previous job has reached a terminal state; reap its thread.
        if let Some(previous) = running.take() {
            join_quietly(previous);
        }

        let pauser = Pauser::new();
        let cancel = CancellationToken::new();
        let importer = BatchImporter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.status),
            cancel.clone(),
            target,
            options,
        );
        let scanner = Scanner::new(
            Arc::clone(&source),
            params,
            importer,
            JobControl {
                status: Arc::clone(&self.status),
                pauser: pauser.clone(),
                cancel: cancel.clone(),
            },
            ScanSettings::from(&self.config),
            Arc::clone(&self.pool_factory),
        );

        let mut handlers = self.completion_handlers.clone();
        handlers.push(Arc::new(LoggingCompletionHandler));
        let status = Arc::clone(&self.status);
        let spawned = thread::Builder::new()
            .name("bulkimport-scanner".to_string())
            .spawn(move || {
                scanner.run();
                for handler in handlers {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.import_complete(&status))) {
                        error!(panic = %panic_message(payload.as_ref()), "Completion handler panicked");
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                info!(
                    job_id = %job_id,
                    source = %source.name(),
                    target = %target_path,
                    dry_run = options.dry_run,
                    replace_existing = options.replace_existing,
                    "Bulk import job started"
                );
                *running = Some(RunningJob {
                    job_id,
                    pauser,
                    cancel,
                    handle: Some(handle),
                });
                Ok(job_id)
            }
            Err(e) => {
                self.status.unexpected_error(ImportError::Io(io::Error::new(
                    e.kind(),
                    format!("failed to start scanner thread: {}", e),
                )));
                self.status.import_complete();
                Err(ImportError::Io(e))
            }
        }
    }

    pub fn pause(&self) -> Result<()> {
        let running = self.lock_running();
        self.status.pause_requested()?;
        if let Some(job) = running.as_ref() {
            job.pauser.pause();
            info!(job_id = %job.job_id, "Bulk import paused");
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let running = self.lock_running();
        self.status.resume_requested()?;
        if let Some(job) = running.as_ref() {
            job.pauser.resume();
            info!(job_id = %job.job_id, "Bulk import resumed");
        }
        Ok(())
    }

    /// Request a stop. In-flight batches roll back; the job ends STOPPED.
    pub fn stop(&self) -> Result<()> {
        let running = self.lock_running();
        self.status.stop_requested()?;
        if let Some(job) = running.as_ref() {
            job.cancel.cancel();
            info!(job_id = %job.job_id, "Bulk import stop requested");
        }
        Ok(())
    }

    /// Block until the current job, including its completion handlers, is done.
    pub fn await_completion(&self) -> Result<()> {
        let handle = self.lock_running().as_mut().and_then(|job| job.handle.take());
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|payload| ImportError::Panic(panic_message(payload.as_ref()))),
            None => Ok(()),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningJob>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn join_quietly(mut job: RunningJob) {
    if let Some(handle) = job.handle.take() {
        if handle.join().is_err() {
            error!(job_id = %job.job_id, "Previous scanner thread panicked");
        }
    }
}
