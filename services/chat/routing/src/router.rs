//! Flood forwarding decisions.
//!
//! The router is synchronous and owns no I/O: the node feeds it every
//! inbound packet and acts on the returned [`RouteAction`]. Forwarding is
//! flood-based with TTL decrement; the route table only biases unicast
//! floods toward a known next hop.

use tracing::{debug, trace};

use whisper_wire::{Packet, PeerId, RouteAdvert, RoutingPayload, MAX_ROUTING_ENTRIES, MAX_TTL};

use crate::seen::SeenSet;
use crate::table::RouteTable;

/// Why a packet was dropped instead of routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Packet originated here and echoed back
    OwnEcho,
    /// Flood id already seen
    Duplicate,
    /// Hop budget exhausted before reaching the destination
    TtlExhausted,
    /// Floodable packet too short to carry a flood id
    Malformed,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::OwnEcho => write!(f, "own echo"),
            DropReason::Duplicate => write!(f, "duplicate"),
            DropReason::TtlExhausted => write!(f, "ttl exhausted"),
            DropReason::Malformed => write!(f, "malformed"),
        }
    }
}

/// What to do with an inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// Process locally, nothing to retransmit
    Deliver,
    /// Retransmit the contained copy, nothing to process locally
    Forward {
        /// TTL-decremented copy to send
        packet: Packet,
        /// Preferred neighbor, `None` means flood every link
        next_hop: Option<PeerId>,
    },
    /// Broadcast addressed to everyone: process locally and retransmit
    DeliverAndForward {
        /// TTL-decremented copy to send
        packet: Packet,
    },
    /// Discard without processing
    Drop(DropReason),
}

/// Counters kept across the router's lifetime.
#[derive(Debug, Default, Clone, Copy)]
pub struct RouterStats {
    /// Packets handed to local processing
    pub delivered: u64,
    /// Packets retransmitted
    pub forwarded: u64,
    /// Packets discarded, any reason
    pub dropped: u64,
}

/// Per-node routing state: duplicate suppression plus the route table.
pub struct MeshRouter {
    me: PeerId,
    seen: SeenSet,
    table: RouteTable,
    stats: RouterStats,
}

impl MeshRouter {
    /// Create a router for the local peer id
    pub fn new(me: PeerId) -> Self {
        Self {
            me,
            seen: SeenSet::default(),
            table: RouteTable::new(),
            stats: RouterStats::default(),
        }
    }

    /// Create a router with explicit duplicate-suppression bounds
    pub fn with_seen_set(me: PeerId, seen: SeenSet) -> Self {
        Self {
            me,
            seen,
            table: RouteTable::new(),
            stats: RouterStats::default(),
        }
    }

    /// The route table, shared with advertisement handling
    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Lifetime counters
    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Decide what to do with an inbound packet.
    ///
    /// Link-local types (discovery, routing, ping, pong) always deliver
    /// and never forward. Floodable types run duplicate suppression
    /// first, so a packet is processed and retransmitted at most once no
    /// matter how many neighbors echo it.
    pub fn decide(&mut self, packet: &Packet) -> RouteAction {
        if packet.source == self.me {
            return self.drop(packet, DropReason::OwnEcho);
        }

        if !packet.is_floodable() {
            self.stats.delivered += 1;
            return RouteAction::Deliver;
        }

        match packet.flood_id() {
            Some(flood_id) => {
                if self.seen.check_and_insert(packet.source, flood_id) {
                    return self.drop(packet, DropReason::Duplicate);
                }
            }
            None => return self.drop(packet, DropReason::Malformed),
        }

        if packet.dest == self.me {
            trace!(source = %packet.source, typ = ?packet.typ, "delivering");
            self.stats.delivered += 1;
            return RouteAction::Deliver;
        }

        if packet.dest.is_broadcast() {
            return match packet.forwarded() {
                Some(copy) => {
                    self.stats.delivered += 1;
                    self.stats.forwarded += 1;
                    RouteAction::DeliverAndForward { packet: copy }
                }
                None => {
                    // Last hop still delivers a broadcast.
                    self.stats.delivered += 1;
                    RouteAction::Deliver
                }
            };
        }

        match packet.forwarded() {
            Some(copy) => {
                let next_hop = self.table.next_hop(packet.dest);
                trace!(
                    dest = %packet.dest,
                    ttl = copy.ttl,
                    biased = next_hop.is_some(),
                    "forwarding"
                );
                self.stats.forwarded += 1;
                RouteAction::Forward {
                    packet: copy,
                    next_hop,
                }
            }
            None => self.drop(packet, DropReason::TtlExhausted),
        }
    }

    /// Apply a neighbor's routing advertisement.
    ///
    /// Every advertised destination becomes reachable through the sender
    /// at one hop more than advertised; hops past the TTL ceiling and
    /// routes to ourselves are ignored.
    pub fn apply_advert(&mut self, from: PeerId, payload: &RoutingPayload) {
        for entry in &payload.entries {
            if entry.dest == self.me {
                continue;
            }
            let metric = entry.hop_metric + 1;
            if metric > MAX_TTL {
                continue;
            }
            self.table.learn(entry.dest, from, metric);
        }
        // The sender itself is one hop away.
        self.table.learn(from, from, 1);
        debug!(from = %from, entries = payload.entries.len(), "advertisement applied");
    }

    /// Build the advertisement this node floods to its neighbors.
    ///
    /// Carries the freshest routes first, capped at the wire limit.
    pub fn build_advert(&self) -> RoutingPayload {
        let mut routes = self.table.snapshot();
        routes.sort_by(|a, b| b.1.updated.cmp(&a.1.updated));
        let entries = routes
            .into_iter()
            .take(MAX_ROUTING_ENTRIES)
            .map(|(dest, route)| RouteAdvert {
                dest,
                next_hop: self.me,
                hop_metric: route.hop_metric,
            })
            .collect();
        RoutingPayload { entries }
    }

    /// Run periodic maintenance, returning pruned (seen, route) counts.
    pub fn sweep(&mut self) -> (usize, usize) {
        (self.seen.prune(), self.table.prune())
    }

    /// Forget everything learned about a vanished neighbor.
    pub fn neighbor_lost(&mut self, neighbor: PeerId) {
        self.table.purge_next_hop(neighbor);
    }

    fn drop(&mut self, packet: &Packet, reason: DropReason) -> RouteAction {
        trace!(source = %packet.source, typ = ?packet.typ, %reason, "dropping packet");
        self.stats.dropped += 1;
        RouteAction::Drop(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes, BytesMut};
    use whisper_wire::{MessageType, PacketFlags};

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b, 0, 0, 0])
    }

    fn private_packet(source: PeerId, dest: PeerId, message_id: u64) -> Packet {
        let mut payload = BytesMut::new();
        payload.put_u64(message_id);
        payload.put_slice(b"ciphertext");
        let mut packet = Packet::new(MessageType::Private, source, dest, payload.freeze());
        packet.flags = PacketFlags::ENCRYPTED | PacketFlags::SIGNED;
        packet
    }

    #[test]
    fn test_delivers_to_self() {
        let mut router = MeshRouter::new(peer(1));
        let packet = private_packet(peer(2), peer(1), 10);
        assert_eq!(router.decide(&packet), RouteAction::Deliver);
    }

    #[test]
    fn test_forwards_for_others() {
        let mut router = MeshRouter::new(peer(1));
        let packet = private_packet(peer(2), peer(3), 10);
        match router.decide(&packet) {
            RouteAction::Forward { packet: copy, next_hop } => {
                assert_eq!(copy.ttl, packet.ttl - 1);
                assert_eq!(next_hop, None);
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn test_forward_biased_by_route_table() {
        let mut router = MeshRouter::new(peer(1));
        router.apply_advert(
            peer(4),
            &RoutingPayload {
                entries: vec![RouteAdvert {
                    dest: peer(3),
                    next_hop: peer(4),
                    hop_metric: 1,
                }],
            },
        );
        let packet = private_packet(peer(2), peer(3), 10);
        match router.decide(&packet) {
            RouteAction::Forward { next_hop, .. } => assert_eq!(next_hop, Some(peer(4))),
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_suppressed() {
        let mut router = MeshRouter::new(peer(1));
        let packet = private_packet(peer(2), peer(1), 10);
        assert_eq!(router.decide(&packet), RouteAction::Deliver);
        assert_eq!(
            router.decide(&packet),
            RouteAction::Drop(DropReason::Duplicate)
        );
        // Different message id from the same source is fresh.
        let next = private_packet(peer(2), peer(1), 11);
        assert_eq!(router.decide(&next), RouteAction::Deliver);
    }

    #[test]
    fn test_broadcast_delivers_and_forwards() {
        let mut router = MeshRouter::new(peer(1));
        let packet = private_packet(peer(2), PeerId::BROADCAST, 10);
        match router.decide(&packet) {
            RouteAction::DeliverAndForward { packet: copy } => {
                assert_eq!(copy.ttl, packet.ttl - 1);
            }
            other => panic!("expected deliver-and-forward, got {other:?}"),
        }
    }

    #[test]
    fn test_ttl_chain_dies_at_zero() {
        let source = peer(9);
        let mut packet = private_packet(source, peer(8), 10);
        assert_eq!(packet.ttl, MAX_TTL);

        // Seven distinct relays forward; the packet arrives at the last
        // with ttl 0 and is dropped rather than retransmitted.
        for hop in 0..7u8 {
            let mut router = MeshRouter::new(peer(hop + 20));
            match router.decide(&packet) {
                RouteAction::Forward { packet: copy, .. } => packet = copy,
                other => panic!("hop {hop}: expected forward, got {other:?}"),
            }
        }
        assert_eq!(packet.ttl, 0);
        let mut last = MeshRouter::new(peer(30));
        assert_eq!(
            last.decide(&packet),
            RouteAction::Drop(DropReason::TtlExhausted)
        );
    }

    #[test]
    fn test_exhausted_broadcast_still_delivers() {
        let mut router = MeshRouter::new(peer(1));
        let mut packet = private_packet(peer(2), PeerId::BROADCAST, 10);
        packet.ttl = 0;
        assert_eq!(router.decide(&packet), RouteAction::Deliver);
    }

    #[test]
    fn test_own_echo_dropped() {
        let mut router = MeshRouter::new(peer(1));
        let packet = private_packet(peer(1), PeerId::BROADCAST, 10);
        assert_eq!(router.decide(&packet), RouteAction::Drop(DropReason::OwnEcho));
    }

    #[test]
    fn test_link_local_never_forwarded() {
        let mut router = MeshRouter::new(peer(1));
        let packet = Packet::new(MessageType::Ping, peer(2), peer(1), Bytes::new());
        assert_eq!(router.decide(&packet), RouteAction::Deliver);
        // Pings carry no flood id; repeats still deliver.
        assert_eq!(router.decide(&packet), RouteAction::Deliver);
    }

    #[test]
    fn test_short_floodable_payload_dropped() {
        let mut router = MeshRouter::new(peer(1));
        let packet = Packet::new(
            MessageType::Private,
            peer(2),
            peer(1),
            Bytes::from_static(&[0; 4]),
        );
        assert_eq!(
            router.decide(&packet),
            RouteAction::Drop(DropReason::Malformed)
        );
    }

    #[test]
    fn test_advert_roundtrip() {
        let mut a = MeshRouter::new(peer(1));
        a.apply_advert(
            peer(2),
            &RoutingPayload {
                entries: vec![RouteAdvert {
                    dest: peer(3),
                    next_hop: peer(2),
                    hop_metric: 0,
                }],
            },
        );
        let advert = a.build_advert();
        assert!(advert.entries.iter().all(|e| e.next_hop == peer(1)));
        assert!(advert.entries.iter().any(|e| e.dest == peer(3) && e.hop_metric == 1));
        assert!(advert.entries.iter().any(|e| e.dest == peer(2) && e.hop_metric == 1));
    }

    #[test]
    fn test_neighbor_lost_purges_routes() {
        let mut router = MeshRouter::new(peer(1));
        router.apply_advert(peer(2), &RoutingPayload { entries: vec![] });
        assert_eq!(router.table().next_hop(peer(2)), Some(peer(2)));
        router.neighbor_lost(peer(2));
        assert_eq!(router.table().next_hop(peer(2)), None);
    }
}
