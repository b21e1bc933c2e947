//! Fixed-header packet codec for the wire protocol.
//!
//! This module defines the 13-byte packet header that every mesh frame
//! carries, small enough to route without touching the (possibly
//! encrypted) payload.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 13;

/// Maximum encoded packet size deliverable in one link-layer send
pub const MAX_PACKET: usize = 512;

/// Maximum payload carried by a single unfragmented packet
pub const MAX_PAYLOAD: usize = MAX_PACKET - HEADER_SIZE;

/// Maximum hop budget
pub const MAX_TTL: u8 = 7;

/// Absolute payload ceiling for reassembled packets (pre-fragmentation)
pub const MAX_MESSAGE: usize = 64 * 1024;

/// Message types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Peer discovery announcement (nickname + public keys)
    Discovery = 0x01,
    /// Password-protected channel message
    Channel = 0x02,
    /// End-to-end encrypted private message
    Private = 0x03,
    /// Routing advertisement
    Routing = 0x04,
    /// Delivery acknowledgment
    Ack = 0x05,
    /// Fragment of an oversized packet
    Fragment = 0x06,
    /// Link liveness probe
    Ping = 0x07,
    /// Liveness probe response
    Pong = 0x08,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Discovery),
            0x02 => Ok(MessageType::Channel),
            0x03 => Ok(MessageType::Private),
            0x04 => Ok(MessageType::Routing),
            0x05 => Ok(MessageType::Ack),
            0x06 => Ok(MessageType::Fragment),
            0x07 => Ok(MessageType::Ping),
            0x08 => Ok(MessageType::Pong),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Packet flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PacketFlags: u8 {
        /// Sender requests an acknowledgment
        const ACK = 0x80;
        /// Payload is a fragment of a larger encoded packet
        const FRAG = 0x40;
        /// Payload is compressed
        const COMPRESSED = 0x20;
        /// Payload is end-to-end encrypted
        const ENCRYPTED = 0x10;
        /// Plaintext carries an Ed25519 signature
        const SIGNED = 0x08;
    }
}

/// A 4-byte mesh peer identifier.
///
/// The all-zero id addresses every reachable peer (broadcast).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 4]);

impl PeerId {
    /// Broadcast destination (all zero bytes)
    pub const BROADCAST: PeerId = PeerId([0; 4]);

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Whether this id is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0; 4]
    }
}

impl From<u32> for PeerId {
    fn from(value: u32) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

/// A parsed mesh packet.
///
/// Immutable once parsed; forwarding produces a fresh copy via
/// [`Packet::forwarded`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version (must be 1)
    pub version: u8,
    /// Message type
    pub typ: MessageType,
    /// Remaining hop budget, 0..=7
    pub ttl: u8,
    /// Packet flags
    pub flags: PacketFlags,
    /// Sender peer id
    pub source: PeerId,
    /// Recipient peer id (zero = broadcast)
    pub dest: PeerId,
    /// Type-specific payload
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet with the current protocol version
    pub fn new(typ: MessageType, source: PeerId, dest: PeerId, payload: Bytes) -> Self {
        Self {
            version: WIRE_VERSION,
            typ,
            ttl: MAX_TTL,
            flags: PacketFlags::empty(),
            source,
            dest,
            payload,
        }
    }

    /// Encode the packet to wire bytes (big-endian).
    ///
    /// The single length byte carries the low byte of the payload length;
    /// the transport delimits messages so the field is a cross-check, not
    /// a framing source.
    pub fn encode(&self) -> Result<Bytes, crate::WireError> {
        if self.ttl > MAX_TTL {
            return Err(crate::WireError::Ttl(self.ttl));
        }
        if self.payload.len() > MAX_MESSAGE {
            return Err(crate::WireError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.version);
        buf.put_u8(self.typ as u8);
        buf.put_u8(self.ttl);
        buf.put_u8(self.flags.bits());
        buf.put_slice(self.source.as_bytes());
        buf.put_slice(self.dest.as_bytes());
        buf.put_u8((self.payload.len() & 0xFF) as u8);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode a packet from a complete wire byte run.
    ///
    /// Validation order: minimum length, version, known type, TTL range,
    /// flag bits, declared payload length against the remaining bytes.
    pub fn decode(mut buf: Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(crate::WireError::Truncated);
        }

        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(crate::WireError::Version(version));
        }

        let typ = MessageType::try_from(buf.get_u8())?;

        let ttl = buf.get_u8();
        if ttl > MAX_TTL {
            return Err(crate::WireError::Ttl(ttl));
        }

        let raw_flags = buf.get_u8();
        let flags =
            PacketFlags::from_bits(raw_flags).ok_or(crate::WireError::Flags(raw_flags))?;

        let mut source = [0u8; 4];
        buf.copy_to_slice(&mut source);
        let mut dest = [0u8; 4];
        buf.copy_to_slice(&mut dest);

        let declared = buf.get_u8();
        let payload = buf;
        if payload.len() > MAX_MESSAGE {
            return Err(crate::WireError::PayloadTooLarge(payload.len()));
        }
        let found = (payload.len() & 0xFF) as u8;
        if declared != found {
            return Err(crate::WireError::Length { declared, found });
        }

        Ok(Self {
            version,
            typ,
            ttl,
            flags,
            source: PeerId(source),
            dest: PeerId(dest),
            payload,
        })
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Whether the encoded packet fits in a single link-layer send
    pub fn fits_mtu(&self) -> bool {
        self.encoded_len() <= MAX_PACKET
    }

    /// Produce the copy retransmitted on a forward: identical except the
    /// TTL is decremented by exactly one. Returns `None` when the hop
    /// budget is already exhausted.
    pub fn forwarded(&self) -> Option<Self> {
        if self.ttl == 0 {
            return None;
        }
        let mut copy = self.clone();
        copy.ttl -= 1;
        Some(copy)
    }

    /// Duplicate-suppression key for floodable packets.
    ///
    /// Channel, private, and ack payloads lead with a u64 message id;
    /// fragments key on `(fragment_id, sequence)` under a distinct tag.
    /// Link-local types (discovery, routing, ping, pong) are never flooded
    /// and have no key.
    pub fn flood_id(&self) -> Option<u64> {
        match self.typ {
            MessageType::Channel | MessageType::Private | MessageType::Ack => {
                if self.payload.len() >= 8 {
                    let mut id = [0u8; 8];
                    id.copy_from_slice(&self.payload[..8]);
                    Some(u64::from_be_bytes(id))
                } else {
                    None
                }
            }
            MessageType::Fragment => {
                if self.payload.len() >= 4 {
                    let fragment_id =
                        u16::from_be_bytes([self.payload[0], self.payload[1]]) as u64;
                    let sequence = u16::from_be_bytes([self.payload[2], self.payload[3]]) as u64;
                    // Tagged to avoid colliding with random message ids
                    Some(0x4652_4147_0000_0000 | (fragment_id << 16) | sequence)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Whether this packet type participates in multi-hop flooding.
    ///
    /// Discovery, routing, ping, and pong are single-hop signals
    /// regenerated per link and never forwarded.
    pub fn is_floodable(&self) -> bool {
        matches!(
            self.typ,
            MessageType::Channel | MessageType::Private | MessageType::Fragment | MessageType::Ack
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        let mut p = Packet::new(
            MessageType::Private,
            PeerId::from_bytes([0xAA; 4]),
            PeerId::from_bytes([0xBB; 4]),
            Bytes::from_static(b"\x00\x00\x00\x00\x00\x00\x00\x2Ahello"),
        );
        p.flags = PacketFlags::ENCRYPTED | PacketFlags::SIGNED;
        p.ttl = 5;
        p
    }

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0x01).unwrap(), MessageType::Discovery);
        assert_eq!(MessageType::try_from(0x08).unwrap(), MessageType::Pong);
        assert!(MessageType::try_from(0x00).is_err());
        assert!(MessageType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_flags() {
        let flags = PacketFlags::FRAG | PacketFlags::ENCRYPTED;
        assert!(flags.contains(PacketFlags::FRAG));
        assert!(!flags.contains(PacketFlags::ACK));
        assert_eq!(flags.bits(), 0x50);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let packet = sample();
        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + packet.payload.len());

        let decoded = Packet::decode(encoded).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let encoded = sample().encode().unwrap();
        assert!(matches!(
            Packet::decode(encoded.slice(..HEADER_SIZE - 1)),
            Err(crate::WireError::Truncated)
        ));
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes[0] = 2;
        assert!(matches!(
            Packet::decode(Bytes::from(bytes)),
            Err(crate::WireError::Version(2))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes[1] = 0x7F;
        assert!(matches!(
            Packet::decode(Bytes::from(bytes)),
            Err(crate::WireError::Type(0x7F))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_ttl() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes[2] = 8;
        assert!(matches!(
            Packet::decode(Bytes::from(bytes)),
            Err(crate::WireError::Ttl(8))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_flags() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes[3] = 0x07; // bits below SIGNED are undefined
        assert!(matches!(
            Packet::decode(Bytes::from(bytes)),
            Err(crate::WireError::Flags(0x07))
        ));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes[12] = bytes[12].wrapping_add(1);
        assert!(matches!(
            Packet::decode(Bytes::from(bytes)),
            Err(crate::WireError::Length { .. })
        ));
    }

    #[test]
    fn test_forwarded_decrements_ttl() {
        let packet = sample();
        let hop = packet.forwarded().unwrap();
        assert_eq!(hop.ttl, packet.ttl - 1);
        assert_eq!(hop.payload, packet.payload);

        let mut exhausted = packet;
        exhausted.ttl = 0;
        assert!(exhausted.forwarded().is_none());
    }

    #[test]
    fn test_seven_forwards_exhaust_budget() {
        let mut packet = sample();
        packet.ttl = MAX_TTL;
        for _ in 0..7 {
            packet = packet.forwarded().unwrap();
        }
        assert_eq!(packet.ttl, 0);
        assert!(packet.forwarded().is_none());
    }

    #[test]
    fn test_flood_id_extraction() {
        let packet = sample();
        assert_eq!(packet.flood_id(), Some(0x2A));

        let ping = Packet::new(
            MessageType::Ping,
            PeerId::from_bytes([1; 4]),
            PeerId::BROADCAST,
            Bytes::new(),
        );
        assert_eq!(ping.flood_id(), None);
        assert!(!ping.is_floodable());
    }

    #[test]
    fn test_broadcast_id() {
        assert!(PeerId::BROADCAST.is_broadcast());
        assert!(!PeerId::from_bytes([0, 0, 0, 1]).is_broadcast());
        assert_eq!(PeerId::from(0xAAAAAAAAu32).to_string(), "aaaaaaaa");
    }

    #[test]
    fn test_length_check_field_is_low_byte() {
        // Payloads beyond 255 bytes still round-trip: the length byte is a
        // modular cross-check because the transport delimits messages.
        let payload = Bytes::from(vec![0x55u8; 300]);
        let packet = Packet::new(
            MessageType::Channel,
            PeerId::from_bytes([1; 4]),
            PeerId::BROADCAST,
            payload,
        );
        let encoded = packet.encode().unwrap();
        assert_eq!(encoded[12], (300 & 0xFF) as u8);
        assert_eq!(Packet::decode(encoded).unwrap(), packet);
    }
}
