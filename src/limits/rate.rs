//! Sliding-window rate limiter
//!
//! Tracks the instants of recent permits in a trailing window. A request is
//! allowed iff fewer than `max_requests` permits fall inside the window;
//! older entries are pruned lazily on every check. `acquire` polls on a
//! short fixed interval — the limiter protects aggregate rate, not
//! per-caller fairness, so polling is sufficient here.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// How often `acquire` re-checks for a free slot
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Usage statistics for dashboards
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateStats {
    /// Permits currently inside the window
    pub current: usize,
    /// Window ceiling
    pub max: usize,
    /// current / max as a percentage
    pub percent: f64,
}

/// Global sliding-window throttle on outbound requests
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter allowing `max_requests` per trailing `window`
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Non-blocking check: record and permit the call if a slot is free
    pub async fn try_acquire(&self) -> bool {
        let mut stamps = self.timestamps.lock().await;
        let now = Instant::now();
        Self::prune(&mut stamps, now, self.window);

        if stamps.len() < self.max_requests {
            stamps.push_back(now);
            true
        } else {
            trace!(
                current = stamps.len(),
                max = self.max_requests,
                "Rate limit window full"
            );
            false
        }
    }

    /// Suspend until a slot opens, then take it. Never fails.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire().await {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Current window usage
    pub async fn stats(&self) -> RateStats {
        let mut stamps = self.timestamps.lock().await;
        Self::prune(&mut stamps, Instant::now(), self.window);

        let current = stamps.len();
        let percent = if self.max_requests == 0 {
            100.0
        } else {
            current as f64 / self.max_requests as f64 * 100.0
        };

        RateStats {
            current,
            max: self.max_requests,
            percent,
        }
    }

    /// Drop entries that have aged out of the window
    fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&front) = stamps.front() {
            if now.duration_since(front) >= window {
                stamps.pop_front();
            } else {
                break;
            }
        }
    }
}
