//! Exponential backoff with jitter between job attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::{WorkerConfig, WorkerDefaults};

/// Delay before the next delivery of a failed job.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (typically 2.0 for doubling).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: WorkerDefaults::BACKOFF_BASE,
            max_delay: WorkerDefaults::BACKOFF_MAX,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            base_delay: config.backoff_base,
            max_delay: config.backoff_max,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after `attempts_done` failed attempts (1 after the first).
    pub fn delay(&self, attempts_done: u32) -> Duration {
        let exponent = attempts_done.saturating_sub(1).min(32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Scale by 0.5..1.5 so the mean delay is unchanged
            let jitter_factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}
