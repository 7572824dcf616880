//! Runtime settings file
//!
//! A small JSON document of operator-tunable options. Unknown keys are
//! preserved but not validated; recognized keys are range-checked before
//! being applied, and a rejected update leaves the previous configuration
//! in effect.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::state::write_atomic;
use crate::types::{Result, WardenError};

/// Allowed range for `startup_delay_ms`
pub const STARTUP_DELAY_RANGE: std::ops::RangeInclusive<u64> = 500..=30_000;

/// Allowed range for `max_reconnect_attempts`
pub const MAX_RECONNECT_RANGE: std::ops::RangeInclusive<u32> = 0..=50;

/// Operator-tunable runtime options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Reconnect dropped sessions automatically
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Sign in invisibly instead of online
    #[serde(default)]
    pub invisible_mode: bool,

    /// Count incoming messages per session
    #[serde(default)]
    pub save_messages: bool,

    /// Verbose logging
    #[serde(default)]
    pub debug: bool,

    /// Delay between session starts during start-all (ms)
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,

    /// Consecutive failures before a session is marked failed
    #[serde(default = "default_max_reconnects")]
    pub max_reconnect_attempts: u32,

    /// Unrecognized keys, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_startup_delay() -> u64 {
    2_000
}

fn default_max_reconnects() -> u32 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            invisible_mode: false,
            save_messages: false,
            debug: false,
            startup_delay_ms: default_startup_delay(),
            max_reconnect_attempts: default_max_reconnects(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Settings {
    /// Range-check the recognized options
    pub fn validate(&self) -> Result<()> {
        if !STARTUP_DELAY_RANGE.contains(&self.startup_delay_ms) {
            return Err(WardenError::Config(format!(
                "startupDelayMs {} outside {}..={} ms",
                self.startup_delay_ms,
                STARTUP_DELAY_RANGE.start(),
                STARTUP_DELAY_RANGE.end(),
            )));
        }
        if !MAX_RECONNECT_RANGE.contains(&self.max_reconnect_attempts) {
            return Err(WardenError::Config(format!(
                "maxReconnectAttempts {} outside {}..={}",
                self.max_reconnect_attempts,
                MAX_RECONNECT_RANGE.start(),
                MAX_RECONNECT_RANGE.end(),
            )));
        }
        Ok(())
    }

    /// Load settings from disk; a missing file yields the defaults.
    /// A document that parses but fails validation is rejected.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No settings file; using defaults");
            return Ok(Self::default());
        }

        let bytes = fs::read(path)?;
        let settings: Self = serde_json::from_slice(&bytes)?;
        settings.validate()?;
        info!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    /// Persist the settings atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)?;
        Ok(())
    }

    /// Replace these settings with `candidate` if it validates; otherwise
    /// keep the current values and report the error.
    pub fn update(&mut self, candidate: Settings) -> Result<()> {
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }
}
