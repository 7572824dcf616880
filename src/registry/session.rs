//! Per-session lifecycle state
//!
//! A [`ManagedSession`] tracks one account's lifecycle plus its runtime
//! handle (ownership of the external client while a connection exists).
//! The `is_active` predicate is deliberately a conjunction: lifecycle state
//! AND a live identity on the handle. Either alone can be stale.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::accounts::AccountRecord;
use crate::client::SessionClient;

/// Lifecycle states of a managed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Not connected, eligible to start
    Idle,
    /// Connection attempt in flight
    Connecting,
    /// Awaiting a human response to an authentication challenge
    Authenticating,
    /// Fully signed in
    Active,
    /// Dropped by the remote service, may reconnect
    Disconnected,
    /// Unrecoverable failure, no automatic retry
    Error,
    /// Operator-initiated shutdown in progress
    Disconnecting,
    /// Gave up after exhausting reconnect attempts
    Failed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Disconnecting => "disconnecting",
            Self::Failed => "failed",
        }
    }

    /// States in which a runtime handle exists
    pub fn holds_handle(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticating | Self::Active | Self::Disconnected
        )
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ownership of the external client plus the elapsed-time counter
pub struct RuntimeHandle {
    pub client: Arc<dyn SessionClient>,
    /// Set while the session is active; cleared on disconnect
    active_since: Option<Instant>,
}

impl RuntimeHandle {
    pub fn new(client: Arc<dyn SessionClient>) -> Self {
        Self {
            client,
            active_since: None,
        }
    }

    /// Start the elapsed-time counter
    pub fn mark_active(&mut self) {
        self.active_since = Some(Instant::now());
    }

    /// Stop the elapsed-time counter
    pub fn mark_inactive(&mut self) {
        self.active_since = None;
    }

    /// Time since the session became active, if it is
    pub fn uptime(&self) -> Option<Duration> {
        self.active_since.map(|since| since.elapsed())
    }

    /// Liveness check against the handle itself, independent of any
    /// locally tracked state
    pub fn has_live_identity(&self) -> bool {
        self.client.live_identity().is_some()
    }
}

/// One account under management
pub struct ManagedSession {
    /// Original-case id for display; lookups use the lowercased key
    pub display_name: String,
    pub record: AccountRecord,
    pub lifecycle: Lifecycle,
    pub handle: Option<RuntimeHandle>,
    /// Failures since the last successful activation
    pub consecutive_failures: u32,
    /// Disconnects observed over the session's lifetime
    pub total_reconnects: u64,
    /// Incoming messages counted while `save_messages` is on
    pub messages_seen: u64,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl ManagedSession {
    pub fn new(record: AccountRecord) -> Self {
        Self {
            display_name: record.username.clone(),
            record,
            lifecycle: Lifecycle::Idle,
            handle: None,
            consecutive_failures: 0,
            total_reconnects: 0,
            messages_seen: 0,
            last_error: None,
            connected_at: None,
        }
    }

    pub fn transition(&mut self, next: Lifecycle) {
        if self.lifecycle != next {
            debug!(
                session = %self.display_name,
                from = %self.lifecycle,
                to = %next,
                "Lifecycle transition"
            );
            self.lifecycle = next;
        }
    }

    /// Whether this session counts as active.
    ///
    /// Lifecycle state alone is NOT sufficient: the external handle must
    /// also still report a live identity. A session whose handle died
    /// under it, or whose handle holds a stale identity after a drop, is
    /// inactive either way.
    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
            && self
                .handle
                .as_ref()
                .map(RuntimeHandle::has_live_identity)
                .unwrap_or(false)
    }
}

/// Point-in-time view of a session for dashboards and reports
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    pub lifecycle: Lifecycle,
    pub active: bool,
    pub uptime_secs: Option<u64>,
    pub consecutive_failures: u32,
    pub total_reconnects: u64,
    pub messages_seen: u64,
    pub last_error: Option<String>,
}

impl SessionStatus {
    pub fn of(session: &ManagedSession) -> Self {
        Self {
            id: session.display_name.clone(),
            lifecycle: session.lifecycle,
            active: session.is_active(),
            uptime_secs: session
                .handle
                .as_ref()
                .and_then(RuntimeHandle::uptime)
                .map(|d| d.as_secs()),
            consecutive_failures: session.consecutive_failures,
            total_reconnects: session.total_reconnects,
            messages_seen: session.messages_seen,
            last_error: session.last_error.clone(),
        }
    }
}
