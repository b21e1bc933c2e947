//! Offline message queues.
//!
//! When a private message cannot reach its recipient, its plaintext is
//! parked here and re-sealed for sending the next time the peer shows
//! up; session keys may have rotated in between, so parking ciphertext
//! would strand the message. Queues are bounded per recipient and swept
//! on a retention clock, so a peer that never returns cannot pin memory.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use whisper_wire::PeerId;

pub use memory::MemoryStore;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend failure
    #[error("store backend: {0}")]
    Backend(String),
}

/// Queue of messages awaiting an offline recipient.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Park a message body for a recipient.
    ///
    /// A full queue drops its oldest entry to admit the new one.
    async fn enqueue(&self, recipient: PeerId, message: Bytes) -> Result<(), StoreError>;

    /// Take every parked message for a recipient, oldest first.
    async fn drain(&self, recipient: PeerId) -> Result<Vec<Bytes>, StoreError>;

    /// Drop messages past the retention window, returning how many.
    async fn sweep_expired(&self) -> Result<usize, StoreError>;

    /// Parked message count for a recipient.
    async fn pending(&self, recipient: PeerId) -> usize;

    /// Drop everything.
    async fn clear(&self);
}
