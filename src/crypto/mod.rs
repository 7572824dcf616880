//! Credential encryption
//!
//! Accounts are stored on disk with their two secret fields wrapped in
//! authenticated-encryption envelopes. The key is either the process master
//! key (environment variable, then key file, then generated on first use)
//! or derived from an operator-supplied password.
//!
//! # Algorithms
//!
//! - **Key Derivation**: Argon2id (memory-hard, brute-force resistant)
//! - **Encryption**: ChaCha20-Poly1305 (authenticated encryption)
//!
//! Decryption fails closed: a bad tag is a [`crate::WardenError::Decrypt`],
//! never silently-returned garbage, and is distinct from
//! [`crate::WardenError::NotEncrypted`] (the input was no envelope at all).

pub mod keys;
pub mod primitives;
pub mod service;

pub use keys::{load_master_key, MASTER_KEY_ENV};
pub use service::CryptoManager;
