//! Exponential reconnect backoff: base * factor^(n-1), capped.

use std::time::Duration;
use crate::config::SupervisorConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    factor: f64,
    max_ms: u64,
    failures: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, factor: f64, max_ms: u64) -> Self {
        Self { base_ms, factor, max_ms, failures: 0 }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.backoff_base_ms, config.backoff_factor, config.backoff_max_ms)
    }

    /// Registers one more consecutive failure and returns the wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for(self.failures)
    }

    /// Delay for the nth consecutive failure (1-based).
    pub fn delay_for(&self, n: u32) -> Duration {
        let exp = n.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_ms as f64 * self.factor.powi(exp);
        let capped = raw.min(self.max_ms as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
