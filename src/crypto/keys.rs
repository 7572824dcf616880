//! Master key loading
//!
//! The process master key is resolved in precedence order:
//!
//! 1. `WARDEN_MASTER_KEY` environment variable (64 hex chars)
//! 2. Key file on disk (owner read/write only)
//! 3. Freshly generated, persisted to the key file for the next start

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::info;
use zeroize::Zeroizing;

use super::primitives::{generate_random_bytes, KEY_LEN};
use crate::types::{Result, WardenError};

/// Environment variable holding the hex-encoded master key
pub const MASTER_KEY_ENV: &str = "WARDEN_MASTER_KEY";

/// Resolve the 32-byte master key.
///
/// An environment key that is present but malformed is an error, not a
/// fallthrough — silently ignoring it would encrypt new data under a
/// different key than the operator expects.
pub fn load_master_key(key_file: &Path) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    if let Ok(hex_key) = std::env::var(MASTER_KEY_ENV) {
        let key = decode_hex_key(hex_key.trim())
            .map_err(|e| WardenError::Crypto(format!("{MASTER_KEY_ENV}: {e}")))?;
        info!("Master key loaded from environment");
        return Ok(key);
    }

    if key_file.exists() {
        let contents = Zeroizing::new(fs::read_to_string(key_file)?);
        let key = decode_hex_key(contents.trim()).map_err(|e| {
            WardenError::Crypto(format!("key file {}: {e}", key_file.display()))
        })?;
        info!(path = %key_file.display(), "Master key loaded from key file");
        return Ok(key);
    }

    generate_and_persist(key_file)
}

fn decode_hex_key(hex_str: &str) -> std::result::Result<Zeroizing<[u8; KEY_LEN]>, String> {
    let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
    if bytes.len() != KEY_LEN {
        return Err(format!("expected {KEY_LEN} bytes, got {}", bytes.len()));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Generate a new key and write it to `key_file` with restrictive
/// permissions, creating parent directories as needed.
fn generate_and_persist(key_file: &Path) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let key = Zeroizing::new(generate_random_bytes::<KEY_LEN>());
    let encoded = Zeroizing::new(hex::encode(key.as_slice()));

    if let Some(parent) = key_file.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    tracing::warn!("Key file permissions cannot be restricted on this platform");

    let mut file = options.open(key_file)?;
    file.write_all(encoded.as_bytes())?;
    file.sync_all()?;

    info!(path = %key_file.display(), "Generated new master key");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generates_and_reloads_same_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");

        let first = load_master_key(&path).unwrap();
        assert!(path.exists());

        let second = load_master_key(&path).unwrap();
        assert_eq!(first.as_slice(), second.as_slice());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        load_master_key(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_key_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        fs::write(&path, "not hex at all").unwrap();

        let result = load_master_key(&path);
        assert!(matches!(result, Err(WardenError::Crypto(_))));
    }

    #[test]
    fn test_short_key_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master.key");
        fs::write(&path, hex::encode([0u8; 16])).unwrap();

        assert!(load_master_key(&path).is_err());
    }
}
