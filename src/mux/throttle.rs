//! Per-key publish throttle. Every attempt refreshes the key's timestamp,
//! throttled ones included, so a continuous drag keeps being coalesced.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct ThrottleLedger {
    min_interval: Duration,
    last_sent: HashMap<String, Instant>,
}

impl ThrottleLedger {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last_sent: HashMap::new() }
    }

    /// Records the attempt and tells whether it must be suppressed.
    pub fn check(&mut self, key: &str, now: Instant) -> bool {
        let throttled = self
            .last_sent
            .get(key)
            .map(|last| now.saturating_duration_since(*last) < self.min_interval)
            .unwrap_or(false);
        self.last_sent.insert(key.to_string(), now);
        throttled
    }

    pub fn len(&self) -> usize {
        self.last_sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_sent.is_empty()
    }
}
