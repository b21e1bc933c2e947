//! AES-256-GCM sealing with timestamped nonces.
//!
//! Sealed layout: `nonce(12) || ciphertext || tag(16)`. The nonce leads
//! with an 8-byte big-endian millisecond timestamp so receivers can run
//! freshness checks without a second header, followed by 4 random bytes.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CryptoError;
use crate::keys::SymmetricKey;

/// Nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Produces strictly increasing timestamped nonces.
///
/// The timestamp half never repeats even when the wall clock stalls or
/// steps backwards: each draw is at least one past the previous.
pub struct NonceGenerator {
    last_millis: AtomicU64,
}

impl NonceGenerator {
    /// Create a generator seeded from the current wall clock
    pub fn new() -> Self {
        Self {
            last_millis: AtomicU64::new(0),
        }
    }

    /// Draw the next nonce
    pub fn next(&self) -> [u8; NONCE_SIZE] {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        // fetch_update yields the previous value; recompute what it stored.
        let previous = self
            .last_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(0);
        let millis = now.max(previous + 1);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&millis.to_be_bytes());
        OsRng.fill_bytes(&mut nonce[8..]);
        nonce
    }
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the millisecond timestamp from a sealed blob's nonce.
pub fn sealed_timestamp(sealed: &[u8]) -> Result<u64, CryptoError> {
    if sealed.len() < NONCE_SIZE {
        return Err(CryptoError::CiphertextTruncated);
    }
    let mut millis = [0u8; 8];
    millis.copy_from_slice(&sealed[..8]);
    Ok(u64::from_be_bytes(millis))
}

/// Extract the full nonce from a sealed blob.
pub fn sealed_nonce(sealed: &[u8]) -> Result<[u8; NONCE_SIZE], CryptoError> {
    if sealed.len() < NONCE_SIZE {
        return Err(CryptoError::CiphertextTruncated);
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&sealed[..NONCE_SIZE]);
    Ok(nonce)
}

/// Seal plaintext under `key`, binding `aad`.
pub fn seal(
    key: &SymmetricKey,
    nonces: &NonceGenerator,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = nonces.next();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed blob under `key`, checking `aad`.
pub fn open(key: &SymmetricKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::CiphertextTruncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}
