//! Gating primitives for outbound traffic to the remote service
//!
//! Three independent throttles compose in front of every connection attempt:
//!
//! - [`RateLimiter`] — sliding-window ceiling on total request rate
//! - [`ConcurrencyLimiter`] — bounded parallelism for in-flight attempts
//! - [`BackoffManager`] — per-session exponential retry spacing
//!
//! None of these reject: callers suspend until they may proceed.

pub mod backoff;
pub mod concurrency;
pub mod rate;

pub use backoff::{BackoffConfig, BackoffManager};
pub use concurrency::ConcurrencyLimiter;
pub use rate::{RateLimiter, RateStats};
