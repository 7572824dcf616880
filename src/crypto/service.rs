//! Envelope encryption service
//!
//! Wraps plaintext secrets in authenticated envelopes:
//!
//! ```text
//! wenc$1$<salt-b64>$<nonce-b64>$<tag-b64>$<ciphertext-b64>
//! ```
//!
//! The salt segment is empty when the process master key was used; it is
//! present when the key was derived from an operator password. The nonce is
//! generated fresh inside every `encrypt` call and never stored on the
//! manager, so reuse under one key cannot happen.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::debug;
use zeroize::Zeroizing;

use super::keys::load_master_key;
use super::primitives::{
    decrypt_payload, derive_key, encrypt_payload, generate_random_bytes, AUTH_TAG_LEN, KEY_LEN,
    NONCE_LEN, SALT_LEN,
};
use crate::accounts::AccountRecord;
use crate::client::Credentials;
use crate::types::{Result, WardenError};

const ENVELOPE_PREFIX: &str = "wenc$1$";

/// Parsed encryption envelope
struct Envelope {
    salt: Option<Vec<u8>>,
    nonce: [u8; NONCE_LEN],
    tag: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl Envelope {
    fn encode(&self) -> String {
        let salt = self
            .salt
            .as_ref()
            .map(|s| BASE64.encode(s))
            .unwrap_or_default();
        format!(
            "{ENVELOPE_PREFIX}{salt}${}${}${}",
            BASE64.encode(self.nonce),
            BASE64.encode(&self.tag),
            BASE64.encode(&self.ciphertext),
        )
    }

    /// Parse an envelope string.
    ///
    /// A value without the envelope prefix is `NotEncrypted`; a value with
    /// the prefix but a malformed body is `Decrypt` (corrupted envelope).
    fn decode(value: &str) -> Result<Self> {
        let body = value.strip_prefix(ENVELOPE_PREFIX).ok_or_else(|| {
            WardenError::NotEncrypted("value does not carry an encryption envelope".into())
        })?;

        let segments: Vec<&str> = body.split('$').collect();
        if segments.len() != 4 {
            return Err(WardenError::Decrypt("malformed envelope".into()));
        }

        let decode = |segment: &str| {
            BASE64
                .decode(segment)
                .map_err(|_| WardenError::Decrypt("malformed envelope encoding".into()))
        };

        let salt = if segments[0].is_empty() {
            None
        } else {
            let salt = decode(segments[0])?;
            if salt.len() != SALT_LEN {
                return Err(WardenError::Decrypt("bad salt length".into()));
            }
            Some(salt)
        };

        let nonce: [u8; NONCE_LEN] = decode(segments[1])?
            .try_into()
            .map_err(|_| WardenError::Decrypt("bad nonce length".into()))?;

        let tag = decode(segments[2])?;
        if tag.len() != AUTH_TAG_LEN {
            return Err(WardenError::Decrypt("bad tag length".into()));
        }

        Ok(Self {
            salt,
            nonce,
            tag,
            ciphertext: decode(segments[3])?,
        })
    }
}

/// Authenticated encryption of persisted credentials
pub struct CryptoManager {
    master_key: Zeroizing<[u8; KEY_LEN]>,
}

impl CryptoManager {
    pub fn new(master_key: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self { master_key }
    }

    /// Resolve the master key (environment, key file, or freshly
    /// generated) and build the manager.
    pub fn load(key_file: &Path) -> Result<Self> {
        Ok(Self::new(load_master_key(key_file)?))
    }

    /// Whether a stored value is an encryption envelope
    pub fn is_envelope(value: &str) -> bool {
        value.starts_with(ENVELOPE_PREFIX)
    }

    /// Encrypt `plaintext` under the master key, or under a key derived
    /// from `password` when one is given.
    pub fn encrypt(&self, plaintext: &str, password: Option<&str>) -> Result<String> {
        let (key, salt) = match password {
            Some(pw) => {
                let salt = generate_random_bytes::<SALT_LEN>();
                let key = Zeroizing::new(derive_key(pw.as_bytes(), &salt)?);
                (key, Some(salt.to_vec()))
            }
            None => (self.master_key.clone(), None),
        };

        // Fresh nonce per call, by construction
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();

        let mut ciphertext = encrypt_payload(&key, &nonce, plaintext.as_bytes())?;
        let tag = ciphertext.split_off(ciphertext.len() - AUTH_TAG_LEN);

        Ok(Envelope {
            salt,
            nonce,
            tag,
            ciphertext,
        }
        .encode())
    }

    /// Decrypt an envelope string, verifying its authentication tag.
    ///
    /// # Errors
    ///
    /// - [`WardenError::NotEncrypted`] — `value` was never an envelope
    /// - [`WardenError::Crypto`] — the envelope needs a password none was
    ///   supplied for
    /// - [`WardenError::Decrypt`] — tampering or a wrong key/password
    pub fn decrypt(&self, value: &str, password: Option<&str>) -> Result<String> {
        let envelope = Envelope::decode(value)?;

        let key = match (&envelope.salt, password) {
            (Some(salt), Some(pw)) => Zeroizing::new(derive_key(pw.as_bytes(), salt)?),
            (Some(_), None) => {
                return Err(WardenError::Crypto(
                    "envelope is password-protected; no password supplied".into(),
                ))
            }
            // Master-key envelope; a password, if passed, is irrelevant
            (None, _) => self.master_key.clone(),
        };

        let mut data = envelope.ciphertext;
        data.extend_from_slice(&envelope.tag);
        let plaintext = decrypt_payload(&key, &envelope.nonce, &data)?;

        String::from_utf8(plaintext)
            .map_err(|_| WardenError::Decrypt("decrypted bytes are not valid UTF-8".into()))
    }

    /// Encrypt the secret fields of an account record in place and set its
    /// `_encrypted` marker. Refuses records that are already encrypted.
    pub fn encrypt_account(
        &self,
        record: &mut AccountRecord,
        password: Option<&str>,
    ) -> Result<()> {
        if record.encrypted {
            return Err(WardenError::AlreadyEncrypted(record.username.clone()));
        }

        // Encrypt into temporaries first so a failure leaves the record
        // untouched rather than half-encrypted.
        let password_envelope = self.encrypt(&record.password, password)?;
        let mfa_envelope = match &record.mfa_secret {
            Some(secret) => Some(self.encrypt(secret, password)?),
            None => None,
        };

        record.password = password_envelope;
        record.mfa_secret = mfa_envelope;
        record.encrypted = true;
        debug!(account = %record.username, "Account credentials encrypted");
        Ok(())
    }

    /// Decrypt the secret fields of an account record in place and clear
    /// its `_encrypted` marker. Refuses records that are not encrypted.
    pub fn decrypt_account(
        &self,
        record: &mut AccountRecord,
        password: Option<&str>,
    ) -> Result<()> {
        if !record.encrypted {
            return Err(WardenError::NotEncrypted(record.username.clone()));
        }

        let password_plain = self.decrypt(&record.password, password)?;
        let mfa_plain = match &record.mfa_secret {
            Some(envelope) => Some(self.decrypt(envelope, password)?),
            None => None,
        };

        record.password = password_plain;
        record.mfa_secret = mfa_plain;
        record.encrypted = false;
        Ok(())
    }

    /// Produce plaintext [`Credentials`] for a connection attempt without
    /// mutating the stored record.
    pub fn credentials_for(
        &self,
        record: &AccountRecord,
        password: Option<&str>,
    ) -> Result<Credentials> {
        if record.encrypted {
            Ok(Credentials {
                username: record.username.clone(),
                password: self.decrypt(&record.password, password)?,
                mfa_secret: record
                    .mfa_secret
                    .as_ref()
                    .map(|envelope| self.decrypt(envelope, password))
                    .transpose()?,
            })
        } else {
            Ok(Credentials {
                username: record.username.clone(),
                password: record.password.clone(),
                mfa_secret: record.mfa_secret.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> CryptoManager {
        CryptoManager::new(Zeroizing::new(generate_random_bytes::<KEY_LEN>()))
    }

    fn test_record() -> AccountRecord {
        AccountRecord {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
            mfa_secret: Some("JBSWY3DP".to_string()),
            activity_ids: vec![730],
            persona: None,
            encrypted: false,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_master_key_roundtrip() {
        let crypto = test_manager();

        let envelope = crypto.encrypt("secret value", None).unwrap();
        assert!(CryptoManager::is_envelope(&envelope));
        // Master-key envelopes have an empty salt segment
        assert!(envelope.starts_with("wenc$1$$"));

        assert_eq!(crypto.decrypt(&envelope, None).unwrap(), "secret value");
    }

    #[test]
    fn test_password_roundtrip() {
        let crypto = test_manager();

        let envelope = crypto.encrypt("secret value", Some("correct horse")).unwrap();
        assert!(!envelope.starts_with("wenc$1$$"));

        let plain = crypto.decrypt(&envelope, Some("correct horse")).unwrap();
        assert_eq!(plain, "secret value");
    }

    #[test]
    fn test_wrong_password_fails_closed() {
        let crypto = test_manager();
        let envelope = crypto.encrypt("secret value", Some("right")).unwrap();

        let result = crypto.decrypt(&envelope, Some("wrong"));
        assert!(matches!(result, Err(WardenError::Decrypt(_))));
    }

    #[test]
    fn test_password_envelope_without_password_is_distinct_error() {
        let crypto = test_manager();
        let envelope = crypto.encrypt("secret value", Some("pw")).unwrap();

        let result = crypto.decrypt(&envelope, None);
        assert!(matches!(result, Err(WardenError::Crypto(_))));
    }

    /// Flipping any single byte of the envelope body must fail decryption,
    /// never return altered plaintext.
    #[test]
    fn test_tampering_detected() {
        let crypto = test_manager();
        let envelope = crypto.encrypt("secret value", None).unwrap();

        let body_start = ENVELOPE_PREFIX.len();
        for i in body_start..envelope.len() {
            let mut bytes = envelope.clone().into_bytes();
            bytes[i] = if bytes[i] == b'A' { b'B' } else { b'A' };
            let Ok(tampered) = String::from_utf8(bytes) else {
                continue;
            };
            if tampered == envelope {
                continue;
            }

            match crypto.decrypt(&tampered, None) {
                Ok(plain) => assert_eq!(plain, "secret value", "tampering returned altered data"),
                Err(WardenError::Decrypt(_)) => {}
                Err(other) => panic!("unexpected error kind: {other}"),
            }
        }
    }

    #[test]
    fn test_plain_value_is_not_encrypted_error() {
        let crypto = test_manager();
        let result = crypto.decrypt("just a plain password", None);
        assert!(matches!(result, Err(WardenError::NotEncrypted(_))));
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let crypto = test_manager();
        let a = crypto.encrypt("same plaintext", None).unwrap();
        let b = crypto.encrypt("same plaintext", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_account_roundtrip_and_double_encrypt_refused() {
        let crypto = test_manager();
        let mut record = test_record();

        crypto.encrypt_account(&mut record, None).unwrap();
        assert!(record.encrypted);
        assert!(CryptoManager::is_envelope(&record.password));
        assert!(CryptoManager::is_envelope(record.mfa_secret.as_deref().unwrap()));

        let again = crypto.encrypt_account(&mut record, None);
        assert!(matches!(again, Err(WardenError::AlreadyEncrypted(_))));

        crypto.decrypt_account(&mut record, None).unwrap();
        assert!(!record.encrypted);
        assert_eq!(record.password, "hunter2");
        assert_eq!(record.mfa_secret.as_deref(), Some("JBSWY3DP"));

        let again = crypto.decrypt_account(&mut record, None);
        assert!(matches!(again, Err(WardenError::NotEncrypted(_))));
    }

    #[test]
    fn test_credentials_for_encrypted_record() {
        let crypto = test_manager();
        let mut record = test_record();
        crypto.encrypt_account(&mut record, None).unwrap();

        let creds = crypto.credentials_for(&record, None).unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "hunter2");
        assert_eq!(creds.mfa_secret.as_deref(), Some("JBSWY3DP"));

        // The stored record stays encrypted
        assert!(record.encrypted);
        assert!(CryptoManager::is_envelope(&record.password));
    }
}
