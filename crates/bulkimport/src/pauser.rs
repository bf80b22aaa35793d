use crate::cancel::CancellationToken;
use crate::error::Result;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How often a paused waiter re-checks its cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Cooperative suspend/resume gate, checked only at batch boundaries.
///
/// Clone is cheap and shares state; the scanner's inline phase and every pool
/// worker hold the same gate.
#[derive(Debug, Clone, Default)]
pub struct Pauser {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Pauser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        *self.lock() = true;
    }

    pub fn resume(&self) {
        let mut paused = self.lock();
        *paused = false;
        self.inner.1.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.lock()
    }

    /// Block while paused. Returns `Interrupted` if `cancel` fires first.
    pub fn block_if_paused(&self, cancel: &CancellationToken) -> Result<()> {
        let mut paused = self.lock();
        while *paused {
            cancel.check("paused")?;
            paused = self
                .inner
                .1
                .wait_timeout(paused, CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_not_paused_passes_through() {
        let pauser = Pauser::new();
        assert!(!pauser.is_paused());
        pauser.block_if_paused(&CancellationToken::new()).unwrap();
    }

    #[test]
    fn test_blocks_until_resumed() {
        let pauser = Pauser::new();
        pauser.pause();
        let passed = Arc::new(AtomicBool::new(false));

        let handle = {
            let pauser = pauser.clone();
            let passed = Arc::clone(&passed);
            thread::spawn(move || {
                pauser.block_if_paused(&CancellationToken::new()).unwrap();
                passed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!passed.load(Ordering::SeqCst), "waiter ran while paused");

        pauser.resume();
        handle.join().unwrap();
        assert!(passed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_releases_paused_waiter() {
        let pauser = Pauser::new();
        pauser.pause();
        let cancel = CancellationToken::new();

        let handle = {
            let pauser = pauser.clone();
            let cancel = cancel.clone();
            thread::spawn(move || pauser.block_if_paused(&cancel))
        };

        let started = Instant::now();
        cancel.cancel();
        let result = handle.join().unwrap();
        assert!(result.unwrap_err().is_interruption());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(pauser.is_paused());
    }
}
