//! Cryptographic primitives for credential envelopes
//!
//! # Security Parameters
//!
//! Argon2id parameters are tuned for password-based key encryption:
//! - 64 MB memory (prevents GPU attacks)
//! - 3 iterations
//! - 4 parallelism threads

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::types::{Result, WardenError};

// =============================================================================
// Constants
// =============================================================================

/// Argon2id memory cost in KiB (64 MB)
pub const ARGON2_MEMORY_KB: u32 = 65536;

/// Argon2id iteration count
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id parallelism (threads)
pub const ARGON2_PARALLELISM: u32 = 4;

/// Salt length for key derivation (16 bytes)
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

/// Key length (256-bit)
pub const KEY_LEN: usize = 32;

// =============================================================================
// Randomness
// =============================================================================

/// Generate cryptographically secure random bytes.
///
/// Salts and nonces are generated through this per call and never cached,
/// so nonce reuse under one key cannot happen by construction.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// =============================================================================
// Key Derivation
// =============================================================================

/// Derive a 256-bit encryption key from a password using Argon2id.
///
/// The salt must be random and unique per envelope; the memory-hard
/// parameters make offline brute-force expensive.
pub fn derive_key(password: &[u8], salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let params = Params::new(
        ARGON2_MEMORY_KB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(KEY_LEN),
    )
    .map_err(|e| WardenError::Crypto(format!("Invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| WardenError::Crypto(format!("Key derivation failed: {e}")))?;

    Ok(key)
}

// =============================================================================
// Encryption / Decryption
// =============================================================================

/// Encrypt with ChaCha20-Poly1305. Returns ciphertext with the 16-byte auth
/// tag appended.
pub fn encrypt_payload(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| WardenError::Crypto(format!("Encryption failed: {e}")))
}

/// Decrypt with ChaCha20-Poly1305, verifying the auth tag.
///
/// # Errors
///
/// [`WardenError::Decrypt`] if the ciphertext was tampered with or the
/// wrong key was used. The plaintext is never partially returned.
pub fn decrypt_payload(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| WardenError::Decrypt("auth tag verification failed".into()))
}
