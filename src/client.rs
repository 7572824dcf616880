//! External session client boundary
//!
//! The remote-service client is a black box behind [`SessionClient`]. Its
//! callback surface is re-expressed as an explicit [`ClientEvent`] stream:
//! every connection attempt gets a fresh client plus an mpsc receiver, and
//! the registry's driver task consumes the stream — message passing, no
//! callback web.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::Result;

/// Plaintext credentials for one account.
///
/// Exists in memory only while a connection attempt is active; the secret
/// fields are wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub mfa_secret: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("mfa_secret", &self.mfa_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Presence shown to the remote service while a session is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Invisible,
}

/// What kind of human response an authentication challenge needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// A code the operator must type in (email / authenticator)
    Code,
    /// Out-of-band approval on another device
    DeviceApproval,
}

/// Transient disconnect causes — the session is eligible for reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionLost,
    RemoteRestart,
    ReplacedByOtherLogin,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConnectionLost => "connection lost",
            Self::RemoteRestart => "remote service restarting",
            Self::ReplacedByOtherLogin => "replaced by another login",
        };
        f.write_str(s)
    }
}

/// Unrecoverable account failures — no automatic reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    AccountDisabled,
    Banned,
    InvalidCredentials,
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AccountDisabled => "account disabled",
            Self::Banned => "account banned",
            Self::InvalidCredentials => "credentials permanently rejected",
        };
        f.write_str(s)
    }
}

/// Events emitted by a session client over its event stream
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Login needs a human response before it can continue
    ChallengeRequested { kind: ChallengeKind },
    /// The session is fully authenticated
    Authenticated { identity: String },
    /// The remote service dropped the session
    Disconnected { reason: DisconnectReason },
    /// An incoming chat message
    MessageReceived { from: String, body: String },
    /// The account can never sign in again without operator action
    Terminal { reason: TerminalReason },
}

/// Command surface of the external session client.
///
/// Implementations wrap the real service SDK; this crate only ever calls
/// through this trait.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Start the login handshake. Progress and completion arrive as events.
    async fn begin_session(&self, credentials: &Credentials) -> Result<()>;

    /// Answer a pending authentication challenge
    async fn submit_challenge(&self, response: &str) -> Result<()>;

    async fn set_presence(&self, presence: Presence) -> Result<()>;

    /// Advertise the given activities on the account
    async fn set_activity(&self, activity_ids: &[u32]) -> Result<()>;

    async fn send_message(&self, to: &str, body: &str) -> Result<()>;

    /// Log off. Completion may also surface as a `Disconnected` event.
    async fn end_session(&self) -> Result<()>;

    /// The identity this handle currently considers signed in, if any.
    ///
    /// This is the liveness source of truth: aggregate "active" counts
    /// must consult it, never lifecycle state alone.
    fn live_identity(&self) -> Option<String>;
}

/// Mints one client (and its event stream) per connection attempt
pub trait ClientFactory: Send + Sync {
    fn connect(&self, account_id: &str) -> (Arc<dyn SessionClient>, mpsc::Receiver<ClientEvent>);
}

// =============================================================================
// Loopback client (development stand-in)
// =============================================================================

/// Development stand-in: authenticates instantly with a synthetic identity
/// and acknowledges every command. Lets the orchestrator run end to end
/// before a real service client is linked in.
pub struct LoopbackClient {
    account: String,
    identity: std::sync::Mutex<Option<String>>,
    events: mpsc::Sender<ClientEvent>,
}

#[async_trait]
impl SessionClient for LoopbackClient {
    async fn begin_session(&self, credentials: &Credentials) -> Result<()> {
        debug!(account = %credentials.username, "Loopback session started");
        let identity = format!("loopback:{}", self.account);
        *self.identity.lock().unwrap() = Some(identity.clone());
        let _ = self.events.send(ClientEvent::Authenticated { identity }).await;
        Ok(())
    }

    async fn submit_challenge(&self, _response: &str) -> Result<()> {
        Ok(())
    }

    async fn set_presence(&self, presence: Presence) -> Result<()> {
        debug!(account = %self.account, presence = ?presence, "Loopback presence set");
        Ok(())
    }

    async fn set_activity(&self, activity_ids: &[u32]) -> Result<()> {
        debug!(account = %self.account, activities = activity_ids.len(), "Loopback activity set");
        Ok(())
    }

    async fn send_message(&self, to: &str, _body: &str) -> Result<()> {
        debug!(account = %self.account, to = %to, "Loopback message sent");
        Ok(())
    }

    async fn end_session(&self) -> Result<()> {
        *self.identity.lock().unwrap() = None;
        Ok(())
    }

    fn live_identity(&self) -> Option<String> {
        self.identity.lock().unwrap().clone()
    }
}

/// Factory for [`LoopbackClient`]s
#[derive(Default)]
pub struct LoopbackFactory;

impl ClientFactory for LoopbackFactory {
    fn connect(&self, account_id: &str) -> (Arc<dyn SessionClient>, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let client = LoopbackClient {
            account: account_id.to_string(),
            identity: std::sync::Mutex::new(None),
            events: tx,
        };
        (Arc::new(client), rx)
    }
}
