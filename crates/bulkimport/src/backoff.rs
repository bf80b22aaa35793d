//! Jittered Fibonacci backoff for retried batches

use std::time::Duration;

const FIBONACCI: [u64; 16] = [1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610, 987];

/// Delay before retry `n` is `FIBONACCI[n - 1] * unit`, scaled by a random
/// factor in `[0.5, 1.5)` and capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    unit: Duration,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(unit: Duration, max: Duration) -> Self {
        Self { unit, max }
    }

    /// No waiting at all.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the retry following failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.unit.is_zero() || self.max.is_zero() {
            return Duration::ZERO;
        }
        let index = (attempt.max(1) as usize - 1).min(FIBONACCI.len() - 1);
        let nominal = self.unit.saturating_mul(FIBONACCI[index] as u32);
        nominal
            .min(self.max)
            .mul_f64(rand::random::<f64>() + 0.5)
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_within_jitter() {
        let backoff = RetryBackoff::new(Duration::from_millis(10), Duration::from_secs(60));

        let first = backoff.delay(1);
        assert!(first >= Duration::from_millis(5) && first < Duration::from_millis(15));
        let seventh = backoff.delay(7);
        assert!(seventh >= Duration::from_millis(65) && seventh < Duration::from_millis(195));
        // Past the end of the table the step stays at the last entry.
        let late = backoff.delay(40);
        assert!(late >= Duration::from_millis(4935) && late < Duration::from_millis(14805));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let backoff = RetryBackoff::new(Duration::from_millis(10), Duration::from_millis(250));
        for attempt in 1..30 {
            assert!(backoff.delay(attempt) <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_none_never_waits() {
        assert_eq!(RetryBackoff::none().delay(12), Duration::ZERO);
        assert_eq!(
            RetryBackoff::new(Duration::ZERO, Duration::from_secs(1)).delay(3),
            Duration::ZERO
        );
    }
}
