//! Transport abstraction.
//!
//! A transport moves opaque frames between this node and its direct
//! neighbors and reports what happens on an event channel. The node
//! never touches sockets or radios directly; swapping TCP for an
//! in-process hub (tests) or a radio backend is a construction-time
//! choice.

use async_trait::async_trait;
use bytes::Bytes;

use whisper_wire::PeerId;

use crate::error::LinkError;

/// Capacity of the transport event channel
pub const EVENT_CHANNEL_DEPTH: usize = 256;

/// What a transport reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A reachable peer announced itself (not yet connected)
    PeerDiscovered {
        /// The peer
        peer: PeerId,
        /// Transport-specific address, for the address book
        addr: String,
    },
    /// A link to the peer is up
    Connected {
        /// The peer
        peer: PeerId,
    },
    /// A complete frame arrived from the peer
    Frame {
        /// Sending neighbor
        peer: PeerId,
        /// Frame contents
        bytes: Bytes,
    },
    /// The link to the peer went down
    LinkClosed {
        /// The peer
        peer: PeerId,
    },
}

/// Frame-oriented neighbor transport.
///
/// Implementations deliver whole frames or nothing; partial frames never
/// surface. Events arrive on the receiver handed out at construction.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to a known peer
    async fn connect(&self, peer: PeerId) -> Result<(), LinkError>;

    /// Send one frame to a connected peer
    async fn send(&self, peer: PeerId, bytes: Bytes) -> Result<(), LinkError>;

    /// Tear down the link to a peer
    async fn disconnect(&self, peer: PeerId) -> Result<(), LinkError>;

    /// Largest frame this transport carries
    fn mtu(&self) -> usize;

    /// Adjust the radio duty cycle, fraction of time spent listening.
    ///
    /// Transports without a radio treat this as a hint and ignore it.
    fn set_duty_cycle(&self, fraction: f32);
}
