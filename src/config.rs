//! Configuration for Warden
//!
//! CLI arguments and environment variable handling using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::limits::BackoffConfig;

/// Warden - keeps many accounts signed in to a remote service
#[derive(Parser, Debug, Clone)]
#[command(name = "warden")]
#[command(about = "Session orchestration core for many concurrent accounts")]
pub struct Args {
    /// Directory holding accounts, settings, state, backups, and the key file
    #[arg(long, env = "WARDEN_DATA_DIR", default_value = "./warden-data")]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Requests permitted per rate-limit window
    #[arg(long, env = "RATE_MAX_REQUESTS", default_value = "25")]
    pub rate_max_requests: usize,

    /// Rate-limit window length in seconds
    #[arg(long, env = "RATE_WINDOW_SECS", default_value = "60")]
    pub rate_window_secs: u64,

    /// Simultaneous in-flight connection attempts
    #[arg(long, env = "MAX_CONCURRENT_CONNECTS", default_value = "3")]
    pub max_concurrent_connects: usize,

    /// First reconnect delay in milliseconds
    #[arg(long, env = "BACKOFF_BASE_MS", default_value = "2000")]
    pub backoff_base_ms: u64,

    /// Reconnect delay ceiling in milliseconds
    #[arg(long, env = "BACKOFF_MAX_MS", default_value = "300000")]
    pub backoff_max_ms: u64,

    /// Upper bound of the random jitter added to every delay (ms)
    #[arg(long, env = "BACKOFF_JITTER_MS", default_value = "1000")]
    pub backoff_jitter_ms: u64,

    /// Seconds between automatic state snapshots
    #[arg(long, env = "AUTOSAVE_INTERVAL_SECS", default_value = "300")]
    pub autosave_interval_secs: u64,

    /// Backups retained before the oldest is evicted
    #[arg(long, env = "MAX_BACKUPS", default_value = "10")]
    pub max_backups: usize,

    /// Bounded wait for a clean logoff during shutdown (ms)
    #[arg(long, env = "LOGOFF_TIMEOUT_MS", default_value = "5000")]
    pub logoff_timeout_ms: u64,

    /// Encrypt credential-store secret fields at rest
    #[arg(long, env = "ENCRYPT_CREDENTIALS", default_value = "false")]
    pub encrypt_credentials: bool,
}

impl Args {
    pub fn accounts_path(&self) -> PathBuf {
        self.data_dir.join("accounts.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn key_file_path(&self) -> PathBuf {
        self.data_dir.join("master.key")
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }

    pub fn logoff_timeout(&self) -> Duration {
        Duration::from_millis(self.logoff_timeout_ms)
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.backoff_base_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(self.backoff_max_ms),
            jitter_max: Duration::from_millis(self.backoff_jitter_ms),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.rate_max_requests == 0 {
            return Err("RATE_MAX_REQUESTS must be at least 1".to_string());
        }
        if self.rate_window_secs == 0 {
            return Err("RATE_WINDOW_SECS must be at least 1".to_string());
        }
        if self.max_concurrent_connects == 0 {
            return Err("MAX_CONCURRENT_CONNECTS must be at least 1".to_string());
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err("BACKOFF_BASE_MS must not exceed BACKOFF_MAX_MS".to_string());
        }
        if self.max_backups == 0 {
            return Err("MAX_BACKUPS must be at least 1".to_string());
        }
        Ok(())
    }
}
