//! Link layer error types.

use thiserror::Error;

use whisper_wire::PeerId;

/// Errors from transports and link management.
#[derive(Error, Debug)]
pub enum LinkError {
    /// No address or hub registration known for the peer
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// No live link to the peer
    #[error("not connected to {0}")]
    NotConnected(PeerId),

    /// Frame exceeds the transport MTU
    #[error("frame of {size} bytes exceeds mtu {mtu}")]
    Mtu {
        /// Offending frame size
        size: usize,
        /// Transport MTU
        mtu: usize,
    },

    /// Outbound queue for the peer is full
    #[error("outbound queue full for {0}")]
    QueueFull(PeerId),

    /// Event or writer channel closed underneath us
    #[error("transport channel closed")]
    ChannelClosed,

    /// Socket level failure
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
