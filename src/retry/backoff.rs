// src/retry/backoff.rs

use crate::config::RetryConfig;
use std::fmt::Debug;
use std::time::Duration;

/// Delay policy applied between failed health checks.
pub trait Backoff: Send + Sync + Debug {
    /// `attempt` is the number of consecutive failures so far, starting at 1.
    fn next_delay(&self, attempt: u32) -> Duration;
}

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.backoff_base(), config.backoff_max(), config.jitter)
    }

    /// Delay before jitter is applied.
    fn capped(&self, attempt: u32) -> u64 {
        let base = self.base.as_millis() as u64;
        let max = self.max.as_millis() as u64;

        // Exponential backoff: base * 2^(attempt - 1)
        let exponent = attempt.saturating_sub(1).min(63);
        let exponential = base.saturating_mul(2u64.saturating_pow(exponent));

        exponential.min(max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let capped = self.capped(attempt);
        let jitter = (capped as f64 * rand::random::<f64>() * self.jitter) as u64;
        Duration::from_millis(capped + jitter)
    }
}

#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}
