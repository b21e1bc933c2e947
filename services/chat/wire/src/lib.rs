//! Binary packet codec, typed payloads, and fragmentation for the whisper mesh.
//!
//! This crate implements the low-level wire protocol shared by every node:
//! the fixed 13-byte packet header, the per-type payload layouts, and the
//! fragment engine that splits encoded packets across the small radio MTU
//! and reassembles them from out-of-order arrivals.
//!
//! ## Wire format
//!
//! ```text
//! +------------+----------------------------------------+
//! | version(1) | must be 0x01                           |
//! | type(1)    | 1=discovery .. 8=pong                  |
//! | ttl(1)     | hop budget, 0..=7                      |
//! | flags(1)   | ACK/FRAG/COMP/ENC/SIGN bitmask         |
//! | source(4)  | sender peer id                         |
//! | dest(4)    | recipient peer id, zero = broadcast    |
//! | len(1)     | low byte of payload length (check)     |
//! +------------+----------------------------------------+
//! | payload    | type-specific layout                   |
//! +------------+----------------------------------------+
//! ```
//!
//! All multi-byte fields are big-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fragment;
pub mod packet;
pub mod payload;

pub use error::WireError;
pub use fragment::{
    FragmentHeader, Fragmenter, Reassembler, FRAGMENT_HEADER_SIZE, MAX_FRAGMENT_PAYLOAD,
};
pub use packet::{
    MessageType, Packet, PacketFlags, PeerId, HEADER_SIZE, MAX_PACKET, MAX_PAYLOAD, MAX_TTL,
    WIRE_VERSION,
};
pub use payload::{
    AckPayload, ChannelPayload, DiscoveryPayload, PayloadKind, PrivatePayload, RouteAdvert,
    RoutingPayload, MAX_ROUTING_ENTRIES,
};
