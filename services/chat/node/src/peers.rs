//! Peer registry.
//!
//! Everything learned about other mesh participants from their discovery
//! announcements: nickname, announced keys, liveness. Bounded; the peer
//! unseen the longest is evicted when a newcomer would overflow it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use whisper_wire::{DiscoveryPayload, PeerId};

/// Maximum peers tracked
pub const MAX_PEERS: usize = 1024;

/// A known mesh participant.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Announced nickname
    pub nickname: String,
    /// Announced Ed25519 verifying key
    pub signing_key: [u8; 32],
    /// Announced X25519 exchange key
    pub exchange_key: [u8; 32],
    /// Last discovery or traffic from this peer
    pub last_seen: Instant,
    /// Whether the peer currently looks reachable
    pub online: bool,
}

/// Bounded registry of discovered peers.
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerInfo>,
    capacity: usize,
}

impl PeerRegistry {
    /// Create a registry with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(MAX_PEERS)
    }

    /// Create a registry with an explicit capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            capacity,
        }
    }

    /// Record a discovery announcement.
    ///
    /// Returns `true` when this is a new peer or a peer coming back
    /// online, which is the trigger for draining its offline queue.
    pub fn observe(&mut self, peer: PeerId, announcement: &DiscoveryPayload) -> bool {
        let reappeared = match self.peers.get(&peer) {
            Some(info) => !info.online,
            None => {
                if self.peers.len() >= self.capacity {
                    self.evict_most_stale();
                }
                true
            }
        };
        self.peers.insert(
            peer,
            PeerInfo {
                nickname: announcement.nickname.clone(),
                signing_key: announcement.signing_key,
                exchange_key: announcement.exchange_key,
                last_seen: Instant::now(),
                online: true,
            },
        );
        if reappeared {
            debug!(peer = %peer, nickname = %announcement.nickname, "peer online");
        }
        reappeared
    }

    /// Refresh liveness on any traffic from the peer
    pub fn touch(&mut self, peer: PeerId) {
        if let Some(info) = self.peers.get_mut(&peer) {
            info.last_seen = Instant::now();
        }
    }

    /// Mark a peer unreachable, keeping its keys.
    ///
    /// Returns `true` if the peer was online.
    pub fn mark_offline(&mut self, peer: PeerId) -> bool {
        match self.peers.get_mut(&peer) {
            Some(info) if info.online => {
                info.online = false;
                debug!(peer = %peer, "peer offline");
                true
            }
            _ => false,
        }
    }

    /// Look up a peer
    pub fn get(&self, peer: PeerId) -> Option<&PeerInfo> {
        self.peers.get(&peer)
    }

    /// Mark peers silent past `timeout` as offline, returning them.
    pub fn sweep_silent(&mut self, timeout: Duration) -> Vec<PeerId> {
        let silent: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, info)| info.online && info.last_seen.elapsed() >= timeout)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &silent {
            self.mark_offline(*peer);
        }
        silent
    }

    /// Number of tracked peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn evict_most_stale(&mut self) {
        let victim = self
            .peers
            .iter()
            .min_by_key(|(_, info)| info.last_seen)
            .map(|(peer, _)| *peer);
        if let Some(victim) = victim {
            self.peers.remove(&victim);
            debug!(peer = %victim, "registry full, evicted stalest peer");
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(nickname: &str) -> DiscoveryPayload {
        DiscoveryPayload {
            nickname: nickname.into(),
            signing_key: [1; 32],
            exchange_key: [2; 32],
        }
    }

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b, 0, 0, 0])
    }

    #[test]
    fn test_observe_reports_reappearance() {
        let mut registry = PeerRegistry::new();
        assert!(registry.observe(peer(1), &announcement("anna")));
        assert!(!registry.observe(peer(1), &announcement("anna")));
        assert!(registry.mark_offline(peer(1)));
        assert!(registry.observe(peer(1), &announcement("anna")));
    }

    #[test]
    fn test_capacity_evicts_stalest() {
        let mut registry = PeerRegistry::with_capacity(2);
        registry.observe(peer(1), &announcement("a"));
        registry.observe(peer(2), &announcement("b"));
        registry.touch(peer(1));
        registry.observe(peer(3), &announcement("c"));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(peer(2)).is_none());
        assert!(registry.get(peer(1)).is_some());
    }

    #[test]
    fn test_sweep_silent() {
        let mut registry = PeerRegistry::new();
        registry.observe(peer(1), &announcement("a"));
        assert_eq!(registry.sweep_silent(Duration::ZERO), vec![peer(1)]);
        assert!(!registry.get(peer(1)).unwrap().online);
        // Already offline peers are not reported twice.
        assert!(registry.sweep_silent(Duration::ZERO).is_empty());
    }
}
