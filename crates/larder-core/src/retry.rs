// ABOUTME: Exponential backoff policy with bounded jitter for failed autosave flushes.
// ABOUTME: Delay computation is pure so tests can pin the jitter; the queue draws jitter at random.

use std::time::Duration;

use rand::Rng;

/// Retry ceiling and backoff shape for the autosave pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of failed attempts after which the batch is dropped.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub max_jitter: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_millis(250),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th consecutive failure
    /// (1-based): `base_delay * 2^(attempt-1) + jitter`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay);
        let jitter = jitter.min(self.max_jitter);
        backoff.saturating_add(jitter).min(self.max_delay)
    }

    /// Draw a jitter value in `[0, max_jitter]`.
    pub fn sample_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Whether `failures` consecutive failures exhaust the policy.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_retries
    }
}
