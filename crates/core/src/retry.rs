//! Retry decision and exponential backoff arithmetic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff policy applied after a failed execution.
///
/// The delay after the `n`-th failure (1-indexed) is `base * 2^(n-1)`,
/// clamped to `cap`. The policy is stateless: the attempt count lives on the
/// job, so the same policy can be shared by every job of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Whether a job that has failed `attempts` times may run again.
    pub fn should_retry(attempts: u32, max_retries: u32) -> bool {
        attempts < max_retries
    }

    /// Delay before the next run after the `attempts`-th failure.
    ///
    /// `attempts == 0` means nothing has failed yet and yields zero.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let factor = match 2u32.checked_pow(attempts - 1) {
            Some(factor) => factor,
            None => return self.cap,
        };

        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}
