//! Credential store file
//!
//! A JSON array of account records on disk. When encryption is enabled the
//! two secret fields hold envelope strings and the `_encrypted` marker is
//! set. Keys this build does not recognize are preserved round-trip so
//! that other tooling can annotate records freely.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::client::Presence;
use crate::state::write_atomic;
use crate::types::Result;

/// One managed account as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Account login name; doubles as the session id
    pub username: String,

    /// Plaintext password, or an envelope string when `_encrypted`
    pub password: String,

    /// Optional second factor secret, same encryption treatment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfa_secret: Option<String>,

    /// Activities to advertise while the session is active
    #[serde(default)]
    pub activity_ids: Vec<u32>,

    /// Per-account presence override (global setting applies when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<Presence>,

    /// Set when the secret fields hold envelopes instead of plaintext
    #[serde(rename = "_encrypted", default)]
    pub encrypted: bool,

    /// Unrecognized keys, preserved verbatim
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Load all account records. A missing file is an empty store.
pub fn load_accounts(path: &Path) -> Result<Vec<AccountRecord>> {
    if !path.exists() {
        debug!(path = %path.display(), "No account store yet");
        return Ok(Vec::new());
    }

    let bytes = fs::read(path)?;
    let records: Vec<AccountRecord> = serde_json::from_slice(&bytes)?;
    info!(count = records.len(), "Loaded account store");
    Ok(records)
}

/// Persist the account store atomically
pub fn save_accounts(path: &Path, records: &[AccountRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(records)?;
    write_atomic(path, &bytes)?;
    debug!(count = records.len(), "Saved account store");
    Ok(())
}
