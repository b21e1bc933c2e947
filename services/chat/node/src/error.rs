//! Node error types.

use thiserror::Error;

use whisper_wire::PeerId;

/// Errors surfaced through the application API.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Wire protocol violation
    #[error(transparent)]
    Wire(#[from] whisper_wire::WireError),

    /// Crypto failure
    #[error(transparent)]
    Crypto(#[from] whisper_crypto::CryptoError),

    /// Offline store failure
    #[error(transparent)]
    Store(#[from] whisper_store::StoreError),

    /// Recipient has never been discovered, no keys to encrypt to
    #[error("peer {0} unknown")]
    PeerUnknown(PeerId),

    /// Not a member of the named channel
    #[error("not joined to channel {0}")]
    NotJoined(String),

    /// The node event loop is gone
    #[error("node stopped")]
    NodeStopped,
}
