use std::time::Duration;

use rand::Rng;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(250);
const RETRY_MAX: Duration = Duration::from_secs(10);
const POSTPONE_DELAY: Duration = Duration::from_secs(1);
const MAX_DOUBLINGS: u32 = 16;

/// What the worker pool does with RETRY and POSTPONE outcomes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Picks each delay from the upper half of the exponential step.
    pub jitter: bool,
    pub max_retries: u32,
    pub postpone_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// `None` once `retry_count` is past the cap and the job should be dropped.
    pub fn retry_delay(&self, retry_count: u32) -> Option<Duration> {
        self.retry_delay_with_rng(retry_count, &mut rand::thread_rng())
    }

    pub fn retry_delay_with_rng<R: Rng + ?Sized>(
        &self,
        retry_count: u32,
        rng: &mut R,
    ) -> Option<Duration> {
        if retry_count > self.max_retries {
            return None;
        }
        let step = self.step(retry_count.saturating_sub(1));
        if self.jitter && !step.is_zero() {
            Some(rng.gen_range(step / 2..=step))
        } else {
            Some(step)
        }
    }

    /// Base delay doubled `attempt` times, never above `max_delay`.
    fn step(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_DOUBLINGS);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: RETRY_BASE,
            max_delay: RETRY_MAX,
            jitter: true,
            max_retries: DEFAULT_MAX_RETRIES,
            postpone_delay: POSTPONE_DELAY,
        }
    }
}
