//! Per-key exponential backoff with jitter
//!
//! Each retry key (one per session) carries a monotonic attempt counter.
//! The delay grows multiplicatively with the counter up to a ceiling, and a
//! bounded uniform jitter is added so that many sessions failing at the same
//! moment (a shared outage) do not retry in lockstep.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::debug;

/// Backoff tuning
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay for the first retry
    pub base: Duration,
    /// Growth factor per recorded failure
    pub multiplier: f64,
    /// Ceiling on the deterministic part of the delay
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to every delay
    pub jitter_max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter_max: Duration::from_secs(1),
        }
    }
}

/// Tracks retry attempts per key and computes the spacing between them
pub struct BackoffManager {
    config: BackoffConfig,
    attempts: DashMap<String, u32>,
}

impl BackoffManager {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: DashMap::new(),
        }
    }

    /// Recorded failure count for a key (0 if never failed)
    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.get(key).map(|a| *a).unwrap_or(0)
    }

    /// Increment the attempt counter after a failure
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut entry = self.attempts.entry(key.to_string()).or_insert(0);
        *entry += 1;
        debug!(key = %key, attempts = *entry, "Recorded failure");
        *entry
    }

    /// Clear the counter after a successful reconnection
    pub fn reset(&self, key: &str) {
        if self.attempts.remove(key).is_some() {
            debug!(key = %key, "Backoff reset");
        }
    }

    /// Delay before the next attempt: `min(base * multiplier^attempts,
    /// max_delay)` plus uniform jitter in `[0, jitter_max]`.
    pub fn delay_for(&self, key: &str) -> Duration {
        let attempts = self.attempts(key);
        let scaled = self
            .config
            .base
            .mul_f64(self.config.multiplier.powi(attempts as i32));
        let capped = scaled.min(self.config.max_delay);

        let jitter_max = self.config.jitter_max.as_millis() as u64;
        let jitter = if jitter_max == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_max))
        };

        capped + jitter
    }

    /// Suspend the caller for the current delay of `key`
    pub async fn wait(&self, key: &str) {
        let delay = self.delay_for(key);
        debug!(key = %key, delay_ms = delay.as_millis() as u64, "Backoff wait");
        tokio::time::sleep(delay).await;
    }
}
