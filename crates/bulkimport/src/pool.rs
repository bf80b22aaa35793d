//! Bounded worker pool with admission control and a cooperative pause gate.
//!
//! Admission is governed by `pool_size + queue_capacity` permits. `execute`
//! blocks the caller until a permit is free, which is the only backpressure
//! between the scanner and the workers. A permit is held from admission until
//! the task has finished; a task may hand back a follow-up task which is put
//! at the back of the queue under the same permit, so requeueing from a worker
//! never waits on the semaphore.

use crate::cancel::CancellationToken;
use crate::error::{panic_message, ImportError, Result};
use crate::pauser::Pauser;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace};

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn total_permits(&self) -> usize {
        self.pool_size + self.queue_capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolState {
    Running,
    Paused,
    ShuttingDown,
    Terminated,
}

/// A unit of work. Returning `Some(task)` requeues the follow-up.
pub struct Task {
    name: String,
    body: Box<dyn FnOnce() -> Option<Task> + Send + 'static>,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce() -> Option<Task> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    shutting_down: bool,
    terminated: bool,
}

struct Shared {
    config: PoolConfig,
    queue: Mutex<Queue>,
    work_available: Condvar,
    permits: Mutex<usize>,
    permit_released: Condvar,
    queued: AtomicUsize,
    active: AtomicUsize,
    outstanding: AtomicUsize,
    pauser: Pauser,
    /// Job token plus the pool's own abandon flag.
    cancel: CancellationToken,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_permit(&self) -> Result<()> {
        let mut available = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            self.cancel.check("waiting for worker pool capacity")?;
            if *available > 0 {
                *available -= 1;
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            available = self
                .permit_released
                .wait_timeout(available, WAIT_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release_permit(&self) {
        let mut available = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        *available += 1;
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.permit_released.notify_one();
    }

    /// Next task for a worker, or `None` once shut down with an empty queue.
    /// The task still counts as queued until the worker gets past the pause gate.
    fn next_task(&self) -> Option<Task> {
        let mut queue = self.lock_queue();
        loop {
            if let Some(task) = queue.tasks.pop_front() {
                return Some(task);
            }
            if queue.shutting_down {
                return None;
            }
            queue = self
                .work_available
                .wait_timeout(queue, WAIT_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn requeue(&self, task: Task) {
        let mut queue = self.lock_queue();
        if self.cancel.is_cancelled() {
            drop(queue);
            debug!(task = %task.name, "Pool abandoned; dropping requeued task");
            self.release_permit();
            return;
        }
        trace!(task = %task.name, "Requeueing task");
        queue.tasks.push_back(task);
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.work_available.notify_one();
    }

    fn worker_loop(&self) {
        while let Some(task) = self.next_task() {
            if self.pauser.block_if_paused(&self.cancel).is_err() {
                debug!(task = %task.name, "Pool abandoned while paused; dropping task");
                self.queued.fetch_sub(1, Ordering::SeqCst);
                self.release_permit();
                continue;
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            self.queued.fetch_sub(1, Ordering::SeqCst);

            let name = task.name;
            let outcome = catch_unwind(AssertUnwindSafe(task.body));
            match outcome {
                Ok(Some(follow_up)) => {
                    // Requeue before going idle so the pool never looks drained in between.
                    self.requeue(follow_up);
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(None) => {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    self.release_permit();
                }
                Err(payload) => {
                    error!(
                        task = %name,
                        panic = %panic_message(payload.as_ref()),
                        "Worker task panicked"
                    );
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    self.release_permit();
                }
            }
        }
    }
}

/// Read-only view of a pool, safe to poll from any thread.
#[derive(Clone)]
pub struct PoolMonitor {
    shared: Arc<Shared>,
}

impl PoolMonitor {
    pub fn queue_size(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.config.queue_capacity
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn pool_size(&self) -> usize {
        self.shared.config.pool_size
    }

    /// Permits currently held by queued or running tasks.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// No task queued, running, or in hand.
    pub fn is_drained(&self) -> bool {
        self.outstanding() == 0
    }

    pub fn state(&self) -> PoolState {
        let queue = self.shared.lock_queue();
        if queue.terminated {
            PoolState::Terminated
        } else if queue.shutting_down {
            PoolState::ShuttingDown
        } else if self.shared.pauser.is_paused() {
            PoolState::Paused
        } else {
            PoolState::Running
        }
    }
}

impl std::fmt::Debug for PoolMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMonitor")
            .field("queue_size", &self.queue_size())
            .field("active", &self.active_count())
            .field("pool_size", &self.pool_size())
            .finish()
    }
}

/// The bounded executor used once an import goes multi-threaded.
pub struct ImportPool {
    shared: Arc<Shared>,
    abandon: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ImportPool {
    /// Spawn `pool_size` named workers.
    pub fn new(config: PoolConfig, pauser: Pauser, cancel: CancellationToken) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(ImportError::Config("pool_size must be at least 1".to_string()));
        }
        let abandon = cancel.child();
        let shared = Arc::new(Shared {
            permits: Mutex::new(config.total_permits()),
            config,
            queue: Mutex::new(Queue::default()),
            work_available: Condvar::new(),
            permit_released: Condvar::new(),
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            pauser,
            cancel: abandon.clone(),
        });

        let pool = Self {
            shared,
            abandon,
            workers: Mutex::new(Vec::new()),
        };
        for n in 1..=pool.shared.config.pool_size {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("bulkimport-worker-{}", n))
                .spawn(move || shared.worker_loop());
            match handle {
                Ok(handle) => pool.lock_workers().push(handle),
                Err(e) => {
                    pool.shutdown_now();
                    pool.await_termination();
                    return Err(ImportError::Io(e));
                }
            }
        }
        debug!(
            pool_size = pool.shared.config.pool_size,
            queue_capacity = pool.shared.config.queue_capacity,
            "Import pool started"
        );
        Ok(pool)
    }

    pub fn monitor(&self) -> PoolMonitor {
        PoolMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Admit a task, blocking while all permits are held.
    ///
    /// A task submitted after shutdown began is dropped. An error means either
    /// the job was cancelled while waiting or the admission invariant broke.
    pub fn execute(&self, task: Task) -> Result<()> {
        self.shared.acquire_permit()?;

        let mut queue = self.shared.lock_queue();
        if queue.shutting_down {
            drop(queue);
            self.shared.release_permit();
            debug!(task = %task.name, "Pool is shutting down; task dropped");
            return Ok(());
        }
        if queue.tasks.len() >= self.shared.config.total_permits() {
            let len = queue.tasks.len();
            drop(queue);
            self.shared.release_permit();
            error!(
                task = %task.name,
                queued = len,
                permits = self.shared.config.total_permits(),
                "BUG: task rejected after permit was granted; back-pressure logic is broken"
            );
            return Err(ImportError::Admission(format!(
                "queue holds {} tasks with {} permits",
                len,
                self.shared.config.total_permits()
            )));
        }
        trace!(task = %task.name, "Task admitted");
        queue.tasks.push_back(task);
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        self.shared.work_available.notify_one();
        Ok(())
    }

    pub fn pause(&self) {
        self.shared.pauser.pause();
    }

    pub fn resume(&self) {
        self.shared.pauser.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.pauser.is_paused()
    }

    /// Stop admitting work; queued tasks still run.
    pub fn shutdown(&self) {
        let mut queue = self.shared.lock_queue();
        if !queue.shutting_down {
            queue.shutting_down = true;
            debug!(queued = queue.tasks.len(), "Import pool shutting down");
        }
        self.shared.work_available.notify_all();
    }

    /// Stop admitting work and abandon the queue. Returns the number of
    /// tasks dropped; running tasks finish on their own.
    pub fn shutdown_now(&self) -> usize {
        self.abandon.cancel();
        let dropped: Vec<Task> = {
            let mut queue = self.shared.lock_queue();
            queue.shutting_down = true;
            self.shared.work_available.notify_all();
            queue.tasks.drain(..).collect()
        };
        for task in &dropped {
            trace!(task = %task.name, "Abandoning queued task");
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            self.shared.release_permit();
        }
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "Import pool abandoned queued tasks");
        }
        dropped.len()
    }

    /// Join every worker. Starts a graceful shutdown if none was requested.
    pub fn await_termination(&self) {
        self.shutdown();
        let handles: Vec<JoinHandle<()>> = self.lock_workers().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Import worker thread exited abnormally");
            }
        }
        self.shared.lock_queue().terminated = true;
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lock_queue().terminated
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ImportPool {
    fn drop(&mut self) {
        if !self.is_terminated() {
            self.shutdown_now();
            self.await_termination();
        }
    }
}

/// Builds the pool for one job; injected so tests can size or wrap it.
pub type PoolFactory =
    Arc<dyn Fn(&PoolConfig, Pauser, CancellationToken) -> Result<ImportPool> + Send + Sync>;

pub fn default_pool_factory() -> PoolFactory {
    Arc::new(|config: &PoolConfig, pauser: Pauser, cancel: CancellationToken| {
        ImportPool::new(config.clone(), pauser, cancel)
    })
}
