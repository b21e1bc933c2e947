//! Type-specific payload layouts.
//!
//! Each message type carries a fixed binary layout after the packet
//! header. Decoders validate minimum lengths and reject malformed
//! payloads with [`WireError::Payload`] naming the offending type.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::packet::{MessageType, PeerId, MAX_TTL};
use crate::WireError;

/// Maximum route advertisements per routing payload
pub const MAX_ROUTING_ENTRIES: usize = 25;

/// Maximum nickname length in a discovery announcement
pub const MAX_NICKNAME: usize = 32;

/// Peer discovery announcement.
///
/// Layout: `nickname_len(1) | nickname | signing_key(32) | exchange_key(32)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPayload {
    /// Human-readable peer nickname (UTF-8, at most 32 bytes)
    pub nickname: String,
    /// Ed25519 verifying key
    pub signing_key: [u8; 32],
    /// X25519 public key for session agreement
    pub exchange_key: [u8; 32],
}

impl DiscoveryPayload {
    /// Encode to wire bytes
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let name = self.nickname.as_bytes();
        if name.len() > MAX_NICKNAME {
            return Err(WireError::Payload("discovery"));
        }
        let mut buf = BytesMut::with_capacity(1 + name.len() + 64);
        buf.put_u8(name.len() as u8);
        buf.put_slice(name);
        buf.put_slice(&self.signing_key);
        buf.put_slice(&self.exchange_key);
        Ok(buf.freeze())
    }

    /// Decode from wire bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.is_empty() {
            return Err(WireError::Payload("discovery"));
        }
        let name_len = buf.get_u8() as usize;
        if name_len > MAX_NICKNAME || buf.len() != name_len + 64 {
            return Err(WireError::Payload("discovery"));
        }
        let nickname = String::from_utf8(buf.split_to(name_len).to_vec())
            .map_err(|_| WireError::Payload("discovery"))?;
        let mut signing_key = [0u8; 32];
        buf.copy_to_slice(&mut signing_key);
        let mut exchange_key = [0u8; 32];
        buf.copy_to_slice(&mut exchange_key);
        Ok(Self {
            nickname,
            signing_key,
            exchange_key,
        })
    }
}

/// Password-protected channel message.
///
/// Layout: `message_id(8) | name_len(1) | channel | ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPayload {
    /// Random message id, doubles as the flood dedup key
    pub message_id: u64,
    /// Channel name (UTF-8)
    pub channel: String,
    /// AES-256-GCM sealed message body
    pub ciphertext: Bytes,
}

impl ChannelPayload {
    /// Encode to wire bytes
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let name = self.channel.as_bytes();
        if name.is_empty() || name.len() > u8::MAX as usize {
            return Err(WireError::Payload("channel"));
        }
        let mut buf = BytesMut::with_capacity(9 + name.len() + self.ciphertext.len());
        buf.put_u64(self.message_id);
        buf.put_u8(name.len() as u8);
        buf.put_slice(name);
        buf.put_slice(&self.ciphertext);
        Ok(buf.freeze())
    }

    /// Decode from wire bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.len() < 10 {
            return Err(WireError::Payload("channel"));
        }
        let message_id = buf.get_u64();
        let name_len = buf.get_u8() as usize;
        if name_len == 0 || buf.len() < name_len {
            return Err(WireError::Payload("channel"));
        }
        let channel = String::from_utf8(buf.split_to(name_len).to_vec())
            .map_err(|_| WireError::Payload("channel"))?;
        Ok(Self {
            message_id,
            channel,
            ciphertext: buf,
        })
    }
}

/// End-to-end encrypted private message.
///
/// Layout: `message_id(8) | ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivatePayload {
    /// Random message id, doubles as the flood dedup key
    pub message_id: u64,
    /// Session-sealed signed plaintext
    pub ciphertext: Bytes,
}

impl PrivatePayload {
    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.ciphertext.len());
        buf.put_u64(self.message_id);
        buf.put_slice(&self.ciphertext);
        buf.freeze()
    }

    /// Decode from wire bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.len() < 8 {
            return Err(WireError::Payload("private"));
        }
        let message_id = buf.get_u64();
        Ok(Self {
            message_id,
            ciphertext: buf,
        })
    }
}

/// One advertised route: destination, advertising next hop, hop count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteAdvert {
    /// Reachable destination
    pub dest: PeerId,
    /// Peer advertising reachability (next hop from the receiver's view)
    pub next_hop: PeerId,
    /// Hops from the next hop to the destination, 0..=7
    pub hop_metric: u8,
}

/// Routing advertisement carrying up to [`MAX_ROUTING_ENTRIES`] routes.
///
/// Layout: `count(1) | count * (dest(4) | next_hop(4) | metric(1))`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoutingPayload {
    /// Advertised routes
    pub entries: Vec<RouteAdvert>,
}

impl RoutingPayload {
    /// Encode to wire bytes
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.entries.len() > MAX_ROUTING_ENTRIES {
            return Err(WireError::Payload("routing"));
        }
        let mut buf = BytesMut::with_capacity(1 + self.entries.len() * 9);
        buf.put_u8(self.entries.len() as u8);
        for entry in &self.entries {
            if entry.hop_metric > MAX_TTL {
                return Err(WireError::Payload("routing"));
            }
            buf.put_slice(entry.dest.as_bytes());
            buf.put_slice(entry.next_hop.as_bytes());
            buf.put_u8(entry.hop_metric);
        }
        Ok(buf.freeze())
    }

    /// Decode from wire bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.is_empty() {
            return Err(WireError::Payload("routing"));
        }
        let count = buf.get_u8() as usize;
        if count > MAX_ROUTING_ENTRIES || buf.len() != count * 9 {
            return Err(WireError::Payload("routing"));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut dest = [0u8; 4];
            buf.copy_to_slice(&mut dest);
            let mut next_hop = [0u8; 4];
            buf.copy_to_slice(&mut next_hop);
            let hop_metric = buf.get_u8();
            if hop_metric > MAX_TTL {
                return Err(WireError::Payload("routing"));
            }
            entries.push(RouteAdvert {
                dest: PeerId(dest),
                next_hop: PeerId(next_hop),
                hop_metric,
            });
        }
        Ok(Self { entries })
    }
}

/// Delivery acknowledgment referencing the original message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    /// Message id being acknowledged
    pub message_id: u64,
}

impl AckPayload {
    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(self.message_id);
        buf.freeze()
    }

    /// Decode from wire bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.len() != 8 {
            return Err(WireError::Payload("ack"));
        }
        Ok(Self {
            message_id: buf.get_u64(),
        })
    }
}

/// A decoded, type-checked payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadKind {
    /// Peer discovery announcement
    Discovery(DiscoveryPayload),
    /// Channel message
    Channel(ChannelPayload),
    /// Private message
    Private(PrivatePayload),
    /// Routing advertisement
    Routing(RoutingPayload),
    /// Delivery acknowledgment
    Ack(AckPayload),
    /// Fragment body (opaque here, parsed by the fragment engine)
    Fragment(Bytes),
    /// Liveness probe (empty)
    Ping,
    /// Liveness response (empty)
    Pong,
}

impl PayloadKind {
    /// Decode a payload according to the packet's message type.
    pub fn decode(typ: MessageType, payload: Bytes) -> Result<Self, WireError> {
        match typ {
            MessageType::Discovery => DiscoveryPayload::decode(payload).map(Self::Discovery),
            MessageType::Channel => ChannelPayload::decode(payload).map(Self::Channel),
            MessageType::Private => PrivatePayload::decode(payload).map(Self::Private),
            MessageType::Routing => RoutingPayload::decode(payload).map(Self::Routing),
            MessageType::Ack => AckPayload::decode(payload).map(Self::Ack),
            MessageType::Fragment => Ok(Self::Fragment(payload)),
            MessageType::Ping => {
                if payload.is_empty() {
                    Ok(Self::Ping)
                } else {
                    Err(WireError::Payload("ping"))
                }
            }
            MessageType::Pong => {
                if payload.is_empty() {
                    Ok(Self::Pong)
                } else {
                    Err(WireError::Payload("pong"))
                }
            }
        }
    }
}
