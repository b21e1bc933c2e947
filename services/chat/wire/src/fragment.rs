//! Packet fragmentation and reassembly.
//!
//! Encoded packets larger than the link MTU are split into fragment
//! packets, each carrying an 8-byte fragment header followed by a chunk
//! of the original encoded bytes. Receivers buffer fragments per
//! `(source, fragment_id)` and hand back the complete byte run once the
//! last piece lands, in any arrival order.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::packet::{MessageType, Packet, PacketFlags, PeerId, HEADER_SIZE, MAX_PACKET};
use crate::WireError;

/// Fragment header size in bytes
pub const FRAGMENT_HEADER_SIZE: usize = 8;

/// Maximum chunk of the original encoded packet per fragment
pub const MAX_FRAGMENT_PAYLOAD: usize = MAX_PACKET - HEADER_SIZE - FRAGMENT_HEADER_SIZE;

/// Default number of in-flight reassembly buffers kept per node
pub const DEFAULT_MAX_BUFFERS: usize = 64;

/// Fragment header preceding each chunk.
///
/// Layout: `fragment_id(2) | sequence(2) | total(2) | offset(2)`, all
/// big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Identifier shared by every fragment of one packet
    pub fragment_id: u16,
    /// 0-based chunk index
    pub sequence: u16,
    /// Total chunk count
    pub total: u16,
    /// Byte offset of this chunk in the original encoded packet
    pub offset: u16,
}

impl FragmentHeader {
    /// Encode into the front of a fragment payload
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.fragment_id);
        buf.put_u16(self.sequence);
        buf.put_u16(self.total);
        buf.put_u16(self.offset);
    }

    /// Decode from the front of a fragment payload, advancing the buffer
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return Err(WireError::Payload("fragment"));
        }
        let header = Self {
            fragment_id: buf.get_u16(),
            sequence: buf.get_u16(),
            total: buf.get_u16(),
            offset: buf.get_u16(),
        };
        if header.total == 0 || header.sequence >= header.total {
            return Err(WireError::FragmentGeometry {
                sequence: header.sequence,
                total: header.total,
            });
        }
        Ok(header)
    }
}

/// Splits oversized encoded packets into MTU-sized fragment packets.
pub struct Fragmenter {
    next_id: u16,
}

impl Fragmenter {
    /// Create a fragmenter with a random starting id
    pub fn new(initial_id: u16) -> Self {
        Self {
            next_id: initial_id,
        }
    }

    /// Split a packet for transmission.
    ///
    /// Packets that already fit the MTU come back unchanged as a single
    /// element. Otherwise the fully encoded bytes (header included) are
    /// chunked and wrapped in fragment packets that copy the original
    /// TTL, source, and destination so each chunk routes independently.
    pub fn split(&mut self, packet: &Packet) -> Result<Vec<Packet>, WireError> {
        if packet.fits_mtu() {
            return Ok(vec![packet.clone()]);
        }

        let encoded = packet.encode()?;
        let total = encoded.len().div_ceil(MAX_FRAGMENT_PAYLOAD);
        if total > u16::MAX as usize {
            return Err(WireError::PayloadTooLarge(encoded.len()));
        }

        let fragment_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        debug!(
            fragment_id,
            total,
            size = encoded.len(),
            "splitting oversized packet"
        );

        let mut fragments = Vec::with_capacity(total);
        for (sequence, chunk) in encoded.chunks(MAX_FRAGMENT_PAYLOAD).enumerate() {
            let mut payload = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
            FragmentHeader {
                fragment_id,
                sequence: sequence as u16,
                total: total as u16,
                offset: (sequence * MAX_FRAGMENT_PAYLOAD) as u16,
            }
            .encode(&mut payload);
            payload.put_slice(chunk);

            let mut fragment = Packet::new(
                MessageType::Fragment,
                packet.source,
                packet.dest,
                payload.freeze(),
            );
            fragment.ttl = packet.ttl;
            fragment.flags = PacketFlags::FRAG;
            fragments.push(fragment);
        }

        Ok(fragments)
    }
}

struct FragmentBuffer {
    total: u16,
    slots: Vec<Option<Bytes>>,
    received: usize,
    created: Instant,
}

/// Buffers inbound fragments until every chunk of a packet has arrived.
///
/// Bounded: when full, the oldest incomplete buffer is evicted to admit
/// a new one. Stale buffers are dropped by [`Reassembler::sweep`].
pub struct Reassembler {
    buffers: HashMap<(PeerId, u16), FragmentBuffer>,
    max_buffers: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERS)
    }
}

impl Reassembler {
    /// Create a reassembler holding at most `max_buffers` partial packets
    pub fn new(max_buffers: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            max_buffers,
        }
    }

    /// Feed one fragment payload (header + chunk) from `source`.
    ///
    /// Returns the complete original encoded packet bytes once the last
    /// chunk arrives, `None` while the packet is still partial. Duplicate
    /// sequences are ignored; geometry conflicts drop the whole buffer.
    pub fn add(
        &mut self,
        source: PeerId,
        mut payload: Bytes,
    ) -> Result<Option<Bytes>, WireError> {
        let header = FragmentHeader::decode(&mut payload)?;
        let key = (source, header.fragment_id);

        if !self.buffers.contains_key(&key) {
            if self.buffers.len() >= self.max_buffers {
                self.evict_oldest();
            }
            self.buffers.insert(
                key,
                FragmentBuffer {
                    total: header.total,
                    slots: vec![None; header.total as usize],
                    received: 0,
                    created: Instant::now(),
                },
            );
        }

        let buffer = self
            .buffers
            .get_mut(&key)
            .ok_or(WireError::Payload("fragment"))?;

        if buffer.total != header.total {
            warn!(
                source = %source,
                fragment_id = header.fragment_id,
                "conflicting fragment totals, dropping buffer"
            );
            self.buffers.remove(&key);
            return Err(WireError::FragmentGeometry {
                sequence: header.sequence,
                total: header.total,
            });
        }

        let slot = &mut buffer.slots[header.sequence as usize];
        if slot.is_none() {
            *slot = Some(payload);
            buffer.received += 1;
        }

        if buffer.received < buffer.total as usize {
            return Ok(None);
        }

        let buffer = self
            .buffers
            .remove(&key)
            .ok_or(WireError::Payload("fragment"))?;
        let mut assembled = BytesMut::new();
        for slot in buffer.slots {
            match slot {
                Some(chunk) => assembled.put_slice(&chunk),
                None => return Err(WireError::Payload("fragment")),
            }
        }
        debug!(
            source = %source,
            fragment_id = header.fragment_id,
            size = assembled.len(),
            "packet reassembled"
        );
        Ok(Some(assembled.freeze()))
    }

    /// Drop buffers older than `timeout`, returning how many were evicted
    pub fn sweep(&mut self, timeout: Duration) -> usize {
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| buffer.created.elapsed() < timeout);
        let evicted = before - self.buffers.len();
        if evicted > 0 {
            debug!(evicted, "swept stale fragment buffers");
        }
        evicted
    }

    /// Number of in-flight partial packets
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .buffers
            .iter()
            .min_by_key(|(_, buffer)| buffer.created)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            warn!(source = %key.0, fragment_id = key.1, "buffer limit reached, evicting oldest");
            self.buffers.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_packet(len: usize) -> Packet {
        let mut payload = vec![0u8; len];
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let mut packet = Packet::new(
            MessageType::Channel,
            PeerId::from_bytes([0xAA; 4]),
            PeerId::BROADCAST,
            Bytes::from(payload),
        );
        packet.flags = PacketFlags::ENCRYPTED;
        packet
    }

    #[test]
    fn test_small_packet_passes_through() {
        let packet = big_packet(100);
        let mut fragmenter = Fragmenter::new(1);
        let out = fragmenter.split(&packet).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], packet);
    }

    #[test]
    fn test_split_geometry() {
        // 1200-byte payload encodes to 1213 bytes: three fragments.
        let packet = big_packet(1200);
        let mut fragmenter = Fragmenter::new(7);
        let fragments = fragmenter.split(&packet).unwrap();
        assert_eq!(fragments.len(), 3);

        for (i, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment.typ, MessageType::Fragment);
            assert!(fragment.flags.contains(PacketFlags::FRAG));
            assert!(fragment.encoded_len() <= MAX_PACKET);
            assert_eq!(fragment.source, packet.source);
            assert_eq!(fragment.dest, packet.dest);

            let mut payload = fragment.payload.clone();
            let header = FragmentHeader::decode(&mut payload).unwrap();
            assert_eq!(header.fragment_id, 7);
            assert_eq!(header.sequence, i as u16);
            assert_eq!(header.total, 3);
            assert_eq!(header.offset, (i * MAX_FRAGMENT_PAYLOAD) as u16);
        }
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let packet = big_packet(1200);
        let mut fragmenter = Fragmenter::new(0);
        let fragments = fragmenter.split(&packet).unwrap();

        let mut reassembler = Reassembler::default();
        let source = packet.source;
        assert!(reassembler
            .add(source, fragments[2].payload.clone())
            .unwrap()
            .is_none());
        assert!(reassembler
            .add(source, fragments[0].payload.clone())
            .unwrap()
            .is_none());
        let assembled = reassembler
            .add(source, fragments[1].payload.clone())
            .unwrap()
            .unwrap();

        assert_eq!(assembled, packet.encode().unwrap());
        assert_eq!(Packet::decode(assembled).unwrap(), packet);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let packet = big_packet(1000);
        let mut fragmenter = Fragmenter::new(3);
        let fragments = fragmenter.split(&packet).unwrap();

        let mut reassembler = Reassembler::default();
        let source = packet.source;
        assert!(reassembler
            .add(source, fragments[0].payload.clone())
            .unwrap()
            .is_none());
        assert!(reassembler
            .add(source, fragments[0].payload.clone())
            .unwrap()
            .is_none());
        assert_eq!(reassembler.pending(), 1);
    }

    #[test]
    fn test_sweep_drops_incomplete() {
        let packet = big_packet(1200);
        let mut fragmenter = Fragmenter::new(9);
        let fragments = fragmenter.split(&packet).unwrap();

        let mut reassembler = Reassembler::default();
        reassembler
            .add(packet.source, fragments[0].payload.clone())
            .unwrap();
        assert_eq!(reassembler.pending(), 1);

        assert_eq!(reassembler.sweep(Duration::ZERO), 1);
        assert_eq!(reassembler.pending(), 0);

        // Straggler after eviction opens a fresh buffer, never completes.
        assert!(reassembler
            .add(packet.source, fragments[1].payload.clone())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_geometry_rejection() {
        let mut reassembler = Reassembler::default();
        // sequence >= total
        let mut bad = BytesMut::new();
        FragmentHeader {
            fragment_id: 1,
            sequence: 3,
            total: 3,
            offset: 0,
        }
        .encode(&mut bad);
        bad.put_slice(b"data");
        assert!(matches!(
            reassembler.add(PeerId::from_bytes([1; 4]), bad.freeze()),
            Err(WireError::FragmentGeometry { .. })
        ));
    }

    #[test]
    fn test_buffer_cap_evicts_oldest() {
        let mut reassembler = Reassembler::new(2);
        let mut fragmenter = Fragmenter::new(0);

        for i in 0..3u8 {
            let packet = big_packet(600);
            let fragments = fragmenter.split(&packet).unwrap();
            reassembler
                .add(PeerId::from_bytes([i, 0, 0, 0]), fragments[0].payload.clone())
                .unwrap();
        }
        assert_eq!(reassembler.pending(), 2);
    }
}
