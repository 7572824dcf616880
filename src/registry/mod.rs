//! Session registry — the orchestration core
//!
//! ## Overview
//!
//! One registry instance per process owns the account→session map and
//! drives every session's lifecycle:
//!
//! 1. Connection attempts pass the concurrency gate, then the rate gate
//! 2. Client events arrive on a per-session mpsc stream consumed by a
//!    driver task (message passing, no callback web)
//! 3. Drops feed the backoff manager; reconnection stops at the attempt
//!    ceiling
//! 4. Aggregate "active" counts always cross-check handle liveness
//!
//! ## Thread Safety
//!
//! Sessions live in a DashMap keyed by the lowercased account id. Map
//! references are never held across awaits; client calls are made on
//! cloned `Arc`s after the map entry is released.

pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::accounts::AccountRecord;
use crate::client::{ClientEvent, ClientFactory, Presence};
use crate::crypto::CryptoManager;
use crate::limits::{BackoffManager, ConcurrencyLimiter, RateLimiter};
use crate::settings::Settings;
use crate::types::{Result, WardenError};

pub use session::{Lifecycle, ManagedSession, RuntimeHandle, SessionStatus};

/// Orchestrator behavior knobs
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub auto_reconnect: bool,
    pub invisible_mode: bool,
    pub save_messages: bool,
    /// Consecutive failures before a session is marked failed
    pub max_reconnect_attempts: u32,
    /// Stagger between session starts in `start_all`
    pub startup_delay: Duration,
    /// Bounded wait for a clean logoff during shutdown
    pub logoff_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), Duration::from_secs(5))
    }
}

impl RegistryConfig {
    pub fn from_settings(settings: &Settings, logoff_timeout: Duration) -> Self {
        Self {
            auto_reconnect: settings.auto_reconnect,
            invisible_mode: settings.invisible_mode,
            save_messages: settings.save_messages,
            max_reconnect_attempts: settings.max_reconnect_attempts,
            startup_delay: Duration::from_millis(settings.startup_delay_ms),
            logoff_timeout,
        }
    }
}

/// Aggregate counts over all sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    /// Sessions passing the state-AND-liveness predicate
    pub active: usize,
    pub connecting: usize,
    pub authenticating: usize,
    pub disconnected: usize,
    pub errored: usize,
    pub failed: usize,
}

/// What to do with a session after a failure
enum RetryDecision {
    Reconnect,
    GiveUp,
    Parked,
}

/// Owns all managed sessions and composes the gating primitives
pub struct SessionRegistry {
    sessions: DashMap<String, ManagedSession>,
    factory: Arc<dyn ClientFactory>,
    crypto: Arc<CryptoManager>,
    rate: Arc<RateLimiter>,
    concurrency: Arc<ConcurrencyLimiter>,
    backoff: Arc<BackoffManager>,
    config: RwLock<RegistryConfig>,
    /// Process-wide failure counter (terminal and connection errors)
    error_count: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        crypto: Arc<CryptoManager>,
        rate: Arc<RateLimiter>,
        concurrency: Arc<ConcurrencyLimiter>,
        backoff: Arc<BackoffManager>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            factory,
            crypto,
            rate,
            concurrency,
            backoff,
            config: RwLock::new(config),
            error_count: AtomicU64::new(0),
        }
    }

    /// Lookup key: account ids compare case-insensitively
    fn key(id: &str) -> String {
        id.to_lowercase()
    }

    fn config(&self) -> RegistryConfig {
        self.config.read().unwrap().clone()
    }

    /// Register an account. The session starts idle.
    pub fn add_account(&self, record: AccountRecord) -> Result<()> {
        let key = Self::key(&record.username);
        if self.sessions.contains_key(&key) {
            return Err(WardenError::Session(format!(
                "account already registered: {}",
                record.username
            )));
        }
        info!(session = %record.username, "Account registered");
        self.sessions.insert(key, ManagedSession::new(record));
        Ok(())
    }

    /// Remove an account. Refused while a runtime handle exists.
    pub fn remove_account(&self, id: &str) -> Result<()> {
        let key = Self::key(id);
        let holds_handle = self
            .sessions
            .get(&key)
            .ok_or_else(|| WardenError::Session(format!("unknown account: {id}")))?
            .lifecycle
            .holds_handle();

        if holds_handle {
            return Err(WardenError::Session(format!(
                "account {id} has a live session; stop it first"
            )));
        }
        self.sessions.remove(&key);
        info!(session = %id, "Account removed");
        Ok(())
    }

    /// Apply new settings if they validate; previous config stays in
    /// effect otherwise.
    pub fn update_config(&self, settings: &Settings) -> Result<()> {
        settings.validate()?;
        let mut config = self.config.write().unwrap();
        let logoff_timeout = config.logoff_timeout;
        *config = RegistryConfig::from_settings(settings, logoff_timeout);
        info!("Registry configuration updated");
        Ok(())
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Start (or restart) a session.
    ///
    /// Admission order is concurrency slot first, then a rate-limit slot,
    /// then the client handshake. Connection failures are recorded on the
    /// session, never raised — one session's failure must not disturb the
    /// caller's loop over others.
    pub async fn connect(self: &Arc<Self>, id: &str) -> Result<()> {
        let key = Self::key(id);

        // Claim the session before any suspension point
        let display_name = {
            let mut entry = self
                .sessions
                .get_mut(&key)
                .ok_or_else(|| WardenError::Session(format!("unknown account: {id}")))?;
            match entry.lifecycle {
                Lifecycle::Idle
                | Lifecycle::Disconnected
                | Lifecycle::Failed
                | Lifecycle::Error => {}
                other => {
                    return Err(WardenError::Session(format!(
                        "session {id} is {other}; cannot start"
                    )))
                }
            }
            entry.transition(Lifecycle::Connecting);
            entry.display_name.clone()
        };

        let (client, events) = self.factory.connect(&display_name);

        let credentials = {
            let mut entry = match self.sessions.get_mut(&key) {
                Some(entry) => entry,
                None => return Ok(()), // removed under us
            };
            entry.handle = Some(RuntimeHandle::new(Arc::clone(&client)));
            self.crypto.credentials_for(&entry.record, None)?
        };

        debug!(session = %display_name, "Waiting for connection slot");
        let begin = self
            .concurrency
            .run(async {
                self.rate.acquire().await;
                client.begin_session(&credentials).await
            })
            .await;
        drop(credentials);

        match begin {
            Ok(()) => {
                let registry = Arc::clone(self);
                tokio::spawn(async move {
                    registry.drive(key, events).await;
                });
                Ok(())
            }
            Err(e) => {
                warn!(session = %display_name, error = %e, "Connection attempt failed");
                self.error_count.fetch_add(1, Ordering::SeqCst);
                self.note_failure(&key, e.to_string(), false);
                Ok(())
            }
        }
    }

    /// Consume one client's event stream until it disconnects or dies
    async fn drive(self: Arc<Self>, key: String, mut events: mpsc::Receiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::ChallengeRequested { kind } => {
                    // Stays here until a human answers; deliberately no
                    // timeout on this state.
                    if let Some(mut entry) = self.sessions.get_mut(&key) {
                        entry.transition(Lifecycle::Authenticating);
                        info!(
                            session = %entry.display_name,
                            kind = ?kind,
                            "Authentication challenge pending operator response"
                        );
                    }
                }

                ClientEvent::Authenticated { identity } => {
                    let activated = {
                        let mut entry = match self.sessions.get_mut(&key) {
                            Some(entry) => entry,
                            None => break,
                        };
                        entry.transition(Lifecycle::Active);
                        entry.connected_at = Some(Utc::now());
                        entry.consecutive_failures = 0;
                        entry.last_error = None;

                        let config = self.config();
                        let presence = entry.record.persona.unwrap_or(if config.invisible_mode {
                            Presence::Invisible
                        } else {
                            Presence::Online
                        });
                        let client = entry.handle.as_mut().map(|handle| {
                            handle.mark_active();
                            Arc::clone(&handle.client)
                        });
                        client.map(|c| (c, presence, entry.record.activity_ids.clone()))
                    };
                    self.backoff.reset(&key);
                    info!(session = %key, identity = %identity, "Session active");

                    if let Some((client, presence, activities)) = activated {
                        if let Err(e) = client.set_presence(presence).await {
                            warn!(session = %key, error = %e, "Failed to apply presence");
                        }
                        if !activities.is_empty() {
                            if let Err(e) = client.set_activity(&activities).await {
                                warn!(session = %key, error = %e, "Failed to apply activity");
                            }
                        }
                    }
                }

                ClientEvent::MessageReceived { from, .. } => {
                    if self.config().save_messages {
                        if let Some(mut entry) = self.sessions.get_mut(&key) {
                            entry.messages_seen += 1;
                            debug!(session = %entry.display_name, from = %from, "Message received");
                        }
                    }
                }

                ClientEvent::Disconnected { reason } => {
                    warn!(session = %key, reason = %reason, "Session dropped");
                    self.note_failure(&key, reason.to_string(), true);
                    // This client is finished; a reconnect gets a new one
                    break;
                }

                ClientEvent::Terminal { reason } => {
                    error!(session = %key, reason = %reason, "Terminal account failure");
                    self.error_count.fetch_add(1, Ordering::SeqCst);
                    if let Some(mut entry) = self.sessions.get_mut(&key) {
                        entry.transition(Lifecycle::Error);
                        entry.handle = None;
                        entry.connected_at = None;
                        entry.last_error = Some(reason.to_string());
                    }
                    break;
                }
            }
        }
        debug!(session = %key, "Event stream ended");
    }

    /// Record a failure, then either park, give up, or schedule a retry.
    ///
    /// `was_connected` distinguishes a drop of an established session
    /// (counts toward the reconnect total) from a failed handshake.
    fn note_failure(self: &Arc<Self>, key: &str, error_text: String, was_connected: bool) {
        let decision = {
            let mut entry = match self.sessions.get_mut(key) {
                Some(entry) => entry,
                None => return,
            };
            if let Some(handle) = entry.handle.as_mut() {
                handle.mark_inactive();
            }
            entry.connected_at = None;
            entry.consecutive_failures += 1;
            if was_connected {
                entry.total_reconnects += 1;
            }
            entry.last_error = Some(error_text);

            let config = self.config();
            if !config.auto_reconnect {
                // The handle stays attached while disconnected; the active
                // predicate's liveness check keeps it out of every count.
                entry.transition(Lifecycle::Disconnected);
                RetryDecision::Parked
            } else if entry.consecutive_failures >= config.max_reconnect_attempts {
                entry.transition(Lifecycle::Failed);
                entry.handle = None;
                RetryDecision::GiveUp
            } else {
                entry.transition(Lifecycle::Disconnected);
                RetryDecision::Reconnect
            }
        };

        self.backoff.record_failure(key);

        match decision {
            RetryDecision::Reconnect => self.spawn_reconnect(key.to_string()),
            RetryDecision::GiveUp => {
                info!(session = %key, "Reconnect attempts exhausted; session failed")
            }
            RetryDecision::Parked => {
                debug!(session = %key, "Auto-reconnect disabled; session parked")
            }
        }
    }

    /// Wait out the backoff, then retry — unless the session moved on
    /// (operator stop, removal) while we slept.
    fn spawn_reconnect(self: &Arc<Self>, key: String) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.backoff.wait(&key).await;

            let still_disconnected = registry
                .sessions
                .get(&key)
                .map(|entry| entry.lifecycle == Lifecycle::Disconnected)
                .unwrap_or(false);
            if !still_disconnected {
                return;
            }

            debug!(session = %key, "Reconnecting");
            if let Err(e) = registry.connect(&key).await {
                warn!(session = %key, error = %e, "Reconnect attempt rejected");
            }
        });
    }

    /// Forward the operator's answer to a pending authentication challenge
    pub async fn submit_challenge(&self, id: &str, response: &str) -> Result<()> {
        let key = Self::key(id);
        let client = {
            let entry = self
                .sessions
                .get(&key)
                .ok_or_else(|| WardenError::Session(format!("unknown account: {id}")))?;
            if entry.lifecycle != Lifecycle::Authenticating {
                return Err(WardenError::Session(format!(
                    "session {id} has no pending challenge"
                )));
            }
            entry
                .handle
                .as_ref()
                .map(|handle| Arc::clone(&handle.client))
                .ok_or_else(|| WardenError::Session(format!("session {id} has no handle")))?
        };
        client.submit_challenge(response).await
    }

    /// Send a chat message through an active session
    pub async fn send_message(&self, id: &str, to: &str, body: &str) -> Result<()> {
        let key = Self::key(id);
        let client = {
            let entry = self
                .sessions
                .get(&key)
                .ok_or_else(|| WardenError::Session(format!("unknown account: {id}")))?;
            if !entry.is_active() {
                return Err(WardenError::Session(format!("session {id} is not active")));
            }
            entry
                .handle
                .as_ref()
                .map(|handle| Arc::clone(&handle.client))
                .ok_or_else(|| WardenError::Session(format!("session {id} has no handle")))?
        };
        client.send_message(to, body).await
    }

    /// Operator-initiated shutdown of one session.
    ///
    /// Attempts a clean logoff with a bounded wait, then force-clears the
    /// handle regardless of whether the logoff completed.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let key = Self::key(id);

        let client = {
            let mut entry = self
                .sessions
                .get_mut(&key)
                .ok_or_else(|| WardenError::Session(format!("unknown account: {id}")))?;
            if !entry.lifecycle.holds_handle() {
                return Ok(());
            }
            entry.transition(Lifecycle::Disconnecting);
            entry.handle.as_ref().map(|handle| Arc::clone(&handle.client))
        };

        if let Some(client) = client {
            let timeout = self.config().logoff_timeout;
            match tokio::time::timeout(timeout, client.end_session()).await {
                Ok(Ok(())) => debug!(session = %id, "Clean logoff"),
                Ok(Err(e)) => warn!(session = %id, error = %e, "Logoff failed; clearing handle"),
                Err(_) => warn!(session = %id, "Logoff timed out; clearing handle"),
            }
        }

        if let Some(mut entry) = self.sessions.get_mut(&key) {
            entry.handle = None;
            entry.connected_at = None;
            entry.consecutive_failures = 0;
            entry.transition(Lifecycle::Idle);
        }
        self.backoff.reset(&key);
        Ok(())
    }

    /// Start every idle session, staggered by the configured delay
    pub async fn start_all(self: &Arc<Self>) {
        let keys: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.lifecycle == Lifecycle::Idle)
            .map(|entry| entry.key().clone())
            .collect();

        info!(count = keys.len(), "Starting all sessions");
        let delay = self.config().startup_delay;
        for (i, key) in keys.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = self.connect(key).await {
                warn!(session = %key, error = %e, "Failed to start session");
            }
        }
    }

    /// Stop every session with a live handle
    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!(count = keys.len(), "Stopping all sessions");
        for key in keys {
            if let Err(e) = self.disconnect(&key).await {
                warn!(session = %key, error = %e, "Failed to stop session");
            }
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Whether a session counts as active (state AND handle liveness)
    pub fn is_active(&self, id: &str) -> bool {
        self.sessions
            .get(&Self::key(id))
            .map(|entry| entry.is_active())
            .unwrap_or(false)
    }

    /// Number of sessions passing the active predicate
    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|entry| entry.is_active()).count()
    }

    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        self.sessions
            .get(&Self::key(id))
            .map(|entry| SessionStatus::of(&entry))
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> = self
            .sessions
            .iter()
            .map(|entry| SessionStatus::of(&entry))
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary::default();
        for entry in self.sessions.iter() {
            summary.total += 1;
            if entry.is_active() {
                summary.active += 1;
            }
            match entry.lifecycle {
                Lifecycle::Connecting => summary.connecting += 1,
                Lifecycle::Authenticating => summary.authenticating += 1,
                Lifecycle::Disconnected => summary.disconnected += 1,
                Lifecycle::Error => summary.errored += 1,
                Lifecycle::Failed => summary.failed += 1,
                _ => {}
            }
        }
        summary
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Produce the state document persisted by the state manager.
    ///
    /// Lifecycle is recorded for inspection only; sessions always restart
    /// idle, so a stale snapshot can never resurrect an "active" claim.
    pub fn snapshot_state(&self) -> Value {
        let mut sessions = serde_json::Map::new();
        for entry in self.sessions.iter() {
            sessions.insert(
                entry.key().clone(),
                json!({
                    "display_name": entry.display_name,
                    "lifecycle": entry.lifecycle,
                    "total_reconnects": entry.total_reconnects,
                    "messages_seen": entry.messages_seen,
                }),
            );
        }
        json!({
            "sessions": sessions,
            "counters": { "errors": self.error_count() },
        })
    }

    /// Restore counters from a loaded snapshot for sessions that are
    /// currently registered; unknown sessions are ignored.
    pub fn restore_state(&self, state: &Value) {
        let mut restored = 0usize;
        if let Some(sessions) = state.get("sessions").and_then(Value::as_object) {
            for (key, doc) in sessions {
                if let Some(mut entry) = self.sessions.get_mut(key) {
                    if let Some(n) = doc.get("total_reconnects").and_then(Value::as_u64) {
                        entry.total_reconnects = n;
                    }
                    if let Some(n) = doc.get("messages_seen").and_then(Value::as_u64) {
                        entry.messages_seen = n;
                    }
                    restored += 1;
                }
            }
        }
        if let Some(errors) = state.pointer("/counters/errors").and_then(Value::as_u64) {
            self.error_count.store(errors, Ordering::SeqCst);
        }
        info!(sessions = restored, "Restored orchestrator state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        ChallengeKind, Credentials, DisconnectReason, SessionClient, TerminalReason,
    };
    use crate::limits::BackoffConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use zeroize::Zeroizing;

    /// Behavior script for one account's connection attempts
    #[derive(Debug, Clone, Copy)]
    enum Script {
        /// Authenticate on every attempt
        Succeed,
        /// Drop immediately on every attempt
        FailAlways,
        /// Drop on the first `n` attempts, then authenticate
        FailTimes(u32),
        /// Report a terminal account failure
        Terminal,
        /// Request a challenge and then go quiet
        Challenge,
    }

    struct ScriptedClient {
        account: String,
        attempt: u32,
        script: Script,
        hang_logoff: bool,
        identity: Mutex<Option<String>>,
        events: mpsc::Sender<ClientEvent>,
    }

    #[async_trait]
    impl SessionClient for ScriptedClient {
        async fn begin_session(&self, _credentials: &Credentials) -> crate::types::Result<()> {
            let event = match self.script {
                Script::Succeed => self.authenticate(),
                Script::FailAlways => ClientEvent::Disconnected {
                    reason: DisconnectReason::ConnectionLost,
                },
                Script::FailTimes(n) if self.attempt < n => ClientEvent::Disconnected {
                    reason: DisconnectReason::ConnectionLost,
                },
                Script::FailTimes(_) => self.authenticate(),
                Script::Terminal => ClientEvent::Terminal {
                    reason: TerminalReason::Banned,
                },
                Script::Challenge => ClientEvent::ChallengeRequested {
                    kind: ChallengeKind::Code,
                },
            };
            let _ = self.events.send(event).await;
            Ok(())
        }

        async fn submit_challenge(&self, _response: &str) -> crate::types::Result<()> {
            Ok(())
        }
        async fn set_presence(&self, _presence: Presence) -> crate::types::Result<()> {
            Ok(())
        }
        async fn set_activity(&self, _activity_ids: &[u32]) -> crate::types::Result<()> {
            Ok(())
        }
        async fn send_message(&self, _to: &str, _body: &str) -> crate::types::Result<()> {
            Ok(())
        }

        async fn end_session(&self) -> crate::types::Result<()> {
            if self.hang_logoff {
                std::future::pending::<()>().await;
            }
            *self.identity.lock().unwrap() = None;
            Ok(())
        }

        fn live_identity(&self) -> Option<String> {
            self.identity.lock().unwrap().clone()
        }
    }

    impl ScriptedClient {
        fn authenticate(&self) -> ClientEvent {
            let identity = format!("{}#{}", self.account, self.attempt);
            *self.identity.lock().unwrap() = Some(identity.clone());
            ClientEvent::Authenticated { identity }
        }

        /// Push an event as if the remote service emitted it
        async fn emit(&self, event: ClientEvent) {
            if matches!(event, ClientEvent::Disconnected { .. }) {
                *self.identity.lock().unwrap() = None;
            }
            let _ = self.events.send(event).await;
        }

        fn clear_identity(&self) {
            *self.identity.lock().unwrap() = None;
        }
    }

    struct ScriptedFactory {
        script: Script,
        hang_logoff: bool,
        attempts: Mutex<HashMap<String, u32>>,
        clients: Mutex<Vec<Arc<ScriptedClient>>>,
    }

    impl ScriptedFactory {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                hang_logoff: false,
                attempts: Mutex::new(HashMap::new()),
                clients: Mutex::new(Vec::new()),
            })
        }

        fn hanging(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                hang_logoff: true,
                attempts: Mutex::new(HashMap::new()),
                clients: Mutex::new(Vec::new()),
            })
        }

        fn attempts_for(&self, account: &str) -> u32 {
            *self
                .attempts
                .lock()
                .unwrap()
                .get(&account.to_lowercase())
                .unwrap_or(&0)
        }

        fn last_client(&self) -> Arc<ScriptedClient> {
            self.clients.lock().unwrap().last().unwrap().clone()
        }
    }

    impl ClientFactory for ScriptedFactory {
        fn connect(
            &self,
            account_id: &str,
        ) -> (Arc<dyn SessionClient>, mpsc::Receiver<ClientEvent>) {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(account_id.to_lowercase()).or_insert(0);
            let attempt = *counter;
            *counter += 1;
            drop(attempts);

            let (tx, rx) = mpsc::channel(8);
            let client = Arc::new(ScriptedClient {
                account: account_id.to_string(),
                attempt,
                script: self.script,
                hang_logoff: self.hang_logoff,
                identity: Mutex::new(None),
                events: tx,
            });
            self.clients.lock().unwrap().push(Arc::clone(&client));
            (client, rx)
        }
    }

    fn record(name: &str) -> AccountRecord {
        AccountRecord {
            username: name.to_string(),
            password: "pw".to_string(),
            mfa_secret: None,
            activity_ids: vec![730],
            persona: None,
            encrypted: false,
            extra: serde_json::Map::new(),
        }
    }

    fn registry_with(
        factory: Arc<ScriptedFactory>,
        max_reconnect_attempts: u32,
        auto_reconnect: bool,
    ) -> Arc<SessionRegistry> {
        let config = RegistryConfig {
            auto_reconnect,
            invisible_mode: false,
            save_messages: true,
            max_reconnect_attempts,
            startup_delay: Duration::from_millis(1),
            logoff_timeout: Duration::from_millis(100),
        };
        Arc::new(SessionRegistry::new(
            factory,
            Arc::new(CryptoManager::new(Zeroizing::new([7u8; 32]))),
            Arc::new(RateLimiter::new(1000, Duration::from_secs(1))),
            Arc::new(ConcurrencyLimiter::new(4)),
            Arc::new(BackoffManager::new(BackoffConfig {
                base: Duration::from_millis(1),
                multiplier: 1.0,
                max_delay: Duration::from_millis(2),
                jitter_max: Duration::ZERO,
            })),
            config,
        ))
    }

    async fn wait_until<F>(what: &str, condition: F)
    where
        F: Fn() -> bool,
    {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    #[tokio::test]
    async fn test_connect_activates_and_applies_config() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("Alice")).unwrap();

        registry.connect("Alice").await.unwrap();
        wait_until("alice active", || registry.is_active("alice")).await;

        let status = registry.status("ALICE").unwrap();
        assert_eq!(status.lifecycle, Lifecycle::Active);
        assert!(status.active);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(factory.attempts_for("alice"), 1);

        let summary = registry.summary();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.active, 1);
    }

    /// Two sessions failing with a ceiling of 5: both end failed after 5
    /// consecutive failures each and no further attempts happen.
    #[tokio::test]
    async fn test_two_sessions_exhaust_reconnect_attempts() {
        let factory = ScriptedFactory::new(Script::FailAlways);
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("alice")).unwrap();
        registry.add_account(record("bob")).unwrap();

        registry.connect("alice").await.unwrap();
        registry.connect("bob").await.unwrap();

        wait_until("both sessions failed", || {
            registry.status("alice").map(|s| s.lifecycle) == Some(Lifecycle::Failed)
                && registry.status("bob").map(|s| s.lifecycle) == Some(Lifecycle::Failed)
        })
        .await;

        assert_eq!(factory.attempts_for("alice"), 5);
        assert_eq!(factory.attempts_for("bob"), 5);

        // No further reconnect attempts after failing
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(factory.attempts_for("alice"), 5);
        assert_eq!(factory.attempts_for("bob"), 5);
        assert_eq!(registry.summary().failed, 2);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let factory = ScriptedFactory::new(Script::FailTimes(2));
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("alice")).unwrap();

        registry.connect("alice").await.unwrap();
        wait_until("alice recovered", || registry.is_active("alice")).await;

        let status = registry.status("alice").unwrap();
        assert_eq!(factory.attempts_for("alice"), 3);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.total_reconnects, 2);
        // Success resets the backoff table
        assert_eq!(registry.backoff.attempts("alice"), 0);
    }

    #[tokio::test]
    async fn test_terminal_failure_stops_retrying() {
        let factory = ScriptedFactory::new(Script::Terminal);
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("alice")).unwrap();

        registry.connect("alice").await.unwrap();
        wait_until("alice errored", || {
            registry.status("alice").map(|s| s.lifecycle) == Some(Lifecycle::Error)
        })
        .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(factory.attempts_for("alice"), 1);
        assert_eq!(registry.error_count(), 1);
        assert_eq!(registry.summary().errored, 1);
    }

    #[tokio::test]
    async fn test_auto_reconnect_disabled_parks_session() {
        let factory = ScriptedFactory::new(Script::FailAlways);
        let registry = registry_with(Arc::clone(&factory), 5, false);
        registry.add_account(record("alice")).unwrap();

        registry.connect("alice").await.unwrap();
        wait_until("alice parked", || {
            registry.status("alice").map(|s| s.lifecycle) == Some(Lifecycle::Disconnected)
        })
        .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(factory.attempts_for("alice"), 1);
    }

    #[tokio::test]
    async fn test_challenge_holds_authenticating_without_timeout() {
        let factory = ScriptedFactory::new(Script::Challenge);
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("alice")).unwrap();

        registry.connect("alice").await.unwrap();
        wait_until("alice authenticating", || {
            registry.status("alice").map(|s| s.lifecycle) == Some(Lifecycle::Authenticating)
        })
        .await;

        // No timeout moves it anywhere; it waits for the human
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            registry.status("alice").unwrap().lifecycle,
            Lifecycle::Authenticating
        );
        assert!(!registry.is_active("alice"));
    }

    /// Regression: an active session whose handle loses its identity must
    /// drop out of the aggregate active count even though its lifecycle
    /// still says active.
    #[tokio::test]
    async fn test_stale_handle_not_counted_active() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("alice")).unwrap();

        registry.connect("alice").await.unwrap();
        wait_until("alice active", || registry.active_count() == 1).await;

        // The external handle dies without an event reaching us
        factory.last_client().clear_identity();

        assert_eq!(
            registry.status("alice").unwrap().lifecycle,
            Lifecycle::Active
        );
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.is_active("alice"));
        assert_eq!(registry.summary().active, 0);
    }

    /// A drop arriving while the stale identity object is still attached
    /// must also report inactive (the other half of the conjunction).
    #[tokio::test]
    async fn test_drop_with_stale_identity_not_counted_active() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let registry = registry_with(Arc::clone(&factory), 5, false);
        registry.add_account(record("alice")).unwrap();

        registry.connect("alice").await.unwrap();
        wait_until("alice active", || registry.is_active("alice")).await;

        // Emit a drop but leave the identity object behind on the handle
        let client = factory.last_client();
        *client.identity.lock().unwrap() = Some("stale".to_string());
        let _ = client
            .events
            .send(ClientEvent::Disconnected {
                reason: DisconnectReason::ConnectionLost,
            })
            .await;

        wait_until("alice disconnected", || {
            registry.status("alice").map(|s| s.lifecycle) == Some(Lifecycle::Disconnected)
        })
        .await;
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_bounded_wait_force_clears() {
        let factory = ScriptedFactory::hanging(Script::Succeed);
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("alice")).unwrap();

        registry.connect("alice").await.unwrap();
        wait_until("alice active", || registry.is_active("alice")).await;

        let start = std::time::Instant::now();
        registry.disconnect("alice").await.unwrap();
        // Bounded by the logoff timeout (100ms), not the hung client
        assert!(start.elapsed() < Duration::from_secs(2));

        let status = registry.status("alice").unwrap();
        assert_eq!(status.lifecycle, Lifecycle::Idle);
        assert!(!status.active);
        assert!(status.uptime_secs.is_none());
    }

    #[tokio::test]
    async fn test_message_counting_respects_setting() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("alice")).unwrap();

        registry.connect("alice").await.unwrap();
        wait_until("alice active", || registry.is_active("alice")).await;

        let client = factory.last_client();
        client
            .emit(ClientEvent::MessageReceived {
                from: "friend".to_string(),
                body: "hi".to_string(),
            })
            .await;

        wait_until("message counted", || {
            registry.status("alice").map(|s| s.messages_seen) == Some(1)
        })
        .await;
    }

    #[tokio::test]
    async fn test_case_insensitive_ids_and_duplicates() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let registry = registry_with(factory, 5, true);

        registry.add_account(record("Alice")).unwrap();
        assert!(registry.status("aLiCe").is_some());
        // Display name keeps its original case
        assert_eq!(registry.status("alice").unwrap().id, "Alice");

        let duplicate = registry.add_account(record("ALICE"));
        assert!(matches!(duplicate, Err(WardenError::Session(_))));
    }

    #[tokio::test]
    async fn test_remove_account_refused_while_live() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let registry = registry_with(factory, 5, true);
        registry.add_account(record("alice")).unwrap();

        registry.connect("alice").await.unwrap();
        wait_until("alice active", || registry.is_active("alice")).await;

        assert!(registry.remove_account("alice").is_err());

        registry.disconnect("alice").await.unwrap();
        registry.remove_account("alice").unwrap();
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_restore_roundtrip() {
        let factory = ScriptedFactory::new(Script::FailTimes(1));
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("alice")).unwrap();

        registry.connect("alice").await.unwrap();
        wait_until("alice recovered", || registry.is_active("alice")).await;

        let snapshot = registry.snapshot_state();
        assert_eq!(snapshot["sessions"]["alice"]["total_reconnects"], 1);

        // A fresh process: same account, counters restored from disk state
        let fresh = registry_with(ScriptedFactory::new(Script::Succeed), 5, true);
        fresh.add_account(record("alice")).unwrap();
        fresh.restore_state(&snapshot);

        let status = fresh.status("alice").unwrap();
        assert_eq!(status.total_reconnects, 1);
        assert_eq!(status.lifecycle, Lifecycle::Idle);
        assert!(!status.active);
    }

    #[tokio::test]
    async fn test_update_config_rejects_invalid_and_keeps_previous() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let registry = registry_with(factory, 5, true);

        let bad = Settings {
            max_reconnect_attempts: 99,
            ..Settings::default()
        };
        assert!(registry.update_config(&bad).is_err());
        assert_eq!(registry.config().max_reconnect_attempts, 5);

        let good = Settings {
            max_reconnect_attempts: 10,
            ..Settings::default()
        };
        registry.update_config(&good).unwrap();
        assert_eq!(registry.config().max_reconnect_attempts, 10);
    }

    #[tokio::test]
    async fn test_send_message_requires_active_session() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("alice")).unwrap();

        let early = registry.send_message("alice", "friend", "hi").await;
        assert!(matches!(early, Err(WardenError::Session(_))));

        registry.connect("alice").await.unwrap();
        wait_until("alice active", || registry.is_active("alice")).await;
        registry.send_message("alice", "friend", "hi").await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_challenge_only_while_authenticating() {
        let factory = ScriptedFactory::new(Script::Challenge);
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("alice")).unwrap();

        let early = registry.submit_challenge("alice", "12345").await;
        assert!(matches!(early, Err(WardenError::Session(_))));

        registry.connect("alice").await.unwrap();
        wait_until("alice authenticating", || {
            registry.status("alice").map(|s| s.lifecycle) == Some(Lifecycle::Authenticating)
        })
        .await;

        registry.submit_challenge("alice", "12345").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_all_connects_idle_sessions() {
        let factory = ScriptedFactory::new(Script::Succeed);
        let registry = registry_with(Arc::clone(&factory), 5, true);
        registry.add_account(record("alice")).unwrap();
        registry.add_account(record("bob")).unwrap();

        registry.start_all().await;
        wait_until("both active", || registry.active_count() == 2).await;

        registry.stop_all().await;
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.summary().total, 2);
    }
}
