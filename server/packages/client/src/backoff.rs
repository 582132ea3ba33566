use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_MAX_JITTER_MS: u64 = 1_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts tolerated before recovery gives up.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to every delay.
    pub max_jitter: Duration,
    /// Wait between resumes while the request is still running.
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_jitter: Duration::from_millis(DEFAULT_MAX_JITTER_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl RetryPolicy {
    /// `min(initial_delay * 2^retry_count, max_delay)`, before jitter.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(31));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_with_jitter(&self, retry_count: u32, jitter: Duration) -> Duration {
        self.base_delay(retry_count) + jitter.min(self.max_jitter)
    }

    /// Base delay plus a uniform sample from `[0, max_jitter]`, so clients
    /// that failed together do not retry together.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        self.delay_with_jitter(retry_count, sample_jitter(self.max_jitter))
    }
}

fn sample_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let mut rng = rand::rng();
    Duration::from_millis(rng.random_range(0..=max.as_millis() as u64))
}
