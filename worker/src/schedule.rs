use std::time::Duration;

use crate::config::RetryConfig;

/// Bounded exponential backoff between retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_retries: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max,
            max_retries,
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(cfg.backoff, cfg.backoff_max, cfg.max_retries)
    }

    /// The delay before the `attempt`-th retry (starting at 1), or `None` once the budget is spent.
    #[inline]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }

        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
