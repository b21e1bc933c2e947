//! Cryptography for the whisper mesh.
//!
//! Four concerns live here:
//!
//! - [`keys`]: Ed25519 signing identities and the peer-id derivation.
//! - [`channel`]: Argon2id password-derived channel keys and signed
//!   channel message sealing.
//! - [`session`]: per-peer private sessions over ephemeral X25519
//!   exchanges, with sign-then-encrypt and deterministic key ratcheting.
//! - [`replay`]: post-decryption nonce and timestamp checks.
//!
//! All symmetric encryption is AES-256-GCM via [`aead`], with the nonce
//! prepended to the ciphertext and an 8-byte timestamp leading the nonce.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod channel;
pub mod error;
pub mod keys;
pub mod replay;
pub mod session;

pub use aead::{sealed_nonce, sealed_timestamp, NonceGenerator, NONCE_SIZE, TAG_SIZE};
pub use channel::{derive_channel_key, ChannelKeyring};
pub use error::CryptoError;
pub use keys::{
    hkdf_derive, peer_id_from_verifying_key, verify_signature, Identity, SymmetricKey,
    SIGNATURE_SIZE,
};
pub use replay::{ReplayGuard, NONCE_WINDOW};
pub use session::{CryptoEngine, ROTATION_INTERVAL, ROTATION_MESSAGES};
