//! Crypto error types.

use thiserror::Error;

/// Errors from key handling, encryption, and replay checks.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Ciphertext failed AEAD authentication
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Ed25519 signature did not verify
    #[error("signature verification failed")]
    BadSignature,

    /// Ciphertext too short to carry nonce and tag
    #[error("ciphertext truncated")]
    CiphertextTruncated,

    /// Nonce already seen from this peer
    #[error("replayed nonce from {0}")]
    ReplayDetected(whisper_wire::PeerId),

    /// Nonce timestamp is behind the peer's watermark
    #[error("stale timestamp from {0}")]
    StaleTimestamp(whisper_wire::PeerId),

    /// No established session with the peer
    #[error("no session with {0}")]
    SessionNotFound(whisper_wire::PeerId),

    /// Key derivation failed
    #[error("key derivation failed: {0}")]
    Kdf(String),

    /// Public key bytes are not a valid curve point
    #[error("invalid public key")]
    InvalidKey,
}
