use crate::error::{ImportError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Token for cooperative cancellation of an import job.
///
/// Uses an AtomicBool internally. Clone is cheap and shares state. A child
/// token observes its parent's cancellation but can be cancelled on its own,
/// which lets the worker pool abandon its queue without stopping the job.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    parent: Option<Arc<CancellationToken>>,
}

impl CancellationToken {
    /// Create a new cancellation token (not cancelled).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that is cancelled when either it or `self` is.
    pub fn child(&self) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.parent.as_ref().map_or(false, |p| p.is_cancelled())
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// `Err(Interrupted)` once cancelled; `activity` names what was cut short.
    pub fn check(&self, activity: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(ImportError::Interrupted(activity.to_string()))
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with `Err(Interrupted)` on cancellation.
    pub fn sleep(&self, duration: Duration, activity: &str) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check(activity)?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
