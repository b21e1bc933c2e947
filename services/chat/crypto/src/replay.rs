//! Replay protection for authenticated messages.
//!
//! Runs after AEAD open succeeds. Each peer gets a timestamp watermark
//! plus a bounded set of recently seen nonces, so a recorded message can
//! be neither replayed verbatim nor re-injected with its original nonce.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use whisper_wire::PeerId;

use crate::aead::NONCE_SIZE;
use crate::error::CryptoError;

/// Nonces remembered per peer
pub const NONCE_WINDOW: usize = 1000;

struct PeerState {
    watermark_millis: u64,
    seen: HashSet<[u8; NONCE_SIZE]>,
    order: VecDeque<[u8; NONCE_SIZE]>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            watermark_millis: 0,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }
}

/// Per-peer replay guard.
pub struct ReplayGuard {
    peers: HashMap<PeerId, PeerState>,
}

impl ReplayGuard {
    /// Create an empty guard
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Check a decrypted message's nonce and advance the peer state.
    ///
    /// `timestamp_millis` is the nonce's leading timestamp. Anything
    /// strictly older than the last accepted timestamp is rejected, so a
    /// burst larger than the nonce window cannot readmit a recorded
    /// message; the nonce set catches duplicates at the watermark itself.
    pub fn check(
        &mut self,
        peer: PeerId,
        nonce: [u8; NONCE_SIZE],
        timestamp_millis: u64,
    ) -> Result<(), CryptoError> {
        let state = self.peers.entry(peer).or_insert_with(PeerState::new);

        if timestamp_millis < state.watermark_millis {
            warn!(
                peer = %peer,
                timestamp_millis,
                watermark = state.watermark_millis,
                "stale timestamp rejected"
            );
            return Err(CryptoError::StaleTimestamp(peer));
        }

        if state.seen.contains(&nonce) {
            warn!(peer = %peer, "replayed nonce rejected");
            return Err(CryptoError::ReplayDetected(peer));
        }

        state.seen.insert(nonce);
        state.order.push_back(nonce);
        if state.order.len() > NONCE_WINDOW {
            if let Some(oldest) = state.order.pop_front() {
                state.seen.remove(&oldest);
            }
        }
        state.watermark_millis = state.watermark_millis.max(timestamp_millis);
        Ok(())
    }

    /// Drop state for peers not heard from anymore
    pub fn forget(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
    }

    /// Drop all per-peer state
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonce(ts: u64, tail: u32) -> [u8; NONCE_SIZE] {
        let mut n = [0u8; NONCE_SIZE];
        n[..8].copy_from_slice(&ts.to_be_bytes());
        n[8..].copy_from_slice(&tail.to_be_bytes());
        n
    }

    #[test]
    fn test_fresh_nonces_accepted() {
        let mut guard = ReplayGuard::new();
        let peer = PeerId::from_bytes([1; 4]);
        for i in 0..10u64 {
            guard.check(peer, nonce(1000 + i, i as u32), 1000 + i).unwrap();
        }
    }

    #[test]
    fn test_replay_rejected() {
        let mut guard = ReplayGuard::new();
        let peer = PeerId::from_bytes([1; 4]);
        let n = nonce(5000, 1);
        guard.check(peer, n, 5000).unwrap();
        assert!(matches!(
            guard.check(peer, n, 5000),
            Err(CryptoError::ReplayDetected(_))
        ));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let mut guard = ReplayGuard::new();
        let peer = PeerId::from_bytes([1; 4]);
        guard.check(peer, nonce(100_000, 0), 100_000).unwrap();
        // Even one millisecond behind the watermark is rejected.
        assert!(matches!(
            guard.check(peer, nonce(99_999, 1), 99_999),
            Err(CryptoError::StaleTimestamp(_))
        ));
        // A fresh nonce at the watermark itself is fine.
        guard.check(peer, nonce(100_000, 2), 100_000).unwrap();
    }

    #[test]
    fn test_burst_cannot_outrun_the_nonce_window() {
        // A replayed nonce pushed out of the bounded set must still fail
        // on the watermark once newer traffic has been accepted.
        let mut guard = ReplayGuard::new();
        let peer = PeerId::from_bytes([1; 4]);
        let recorded = nonce(1000, 0);
        guard.check(peer, recorded, 1000).unwrap();
        for i in 1..=(NONCE_WINDOW as u64 + 1) {
            guard.check(peer, nonce(1000 + i, i as u32), 1000 + i).unwrap();
        }
        assert!(matches!(
            guard.check(peer, recorded, 1000),
            Err(CryptoError::StaleTimestamp(_))
        ));
    }

    #[test]
    fn test_window_is_bounded() {
        let mut guard = ReplayGuard::new();
        let peer = PeerId::from_bytes([1; 4]);
        for i in 0..(NONCE_WINDOW as u64 + 10) {
            guard.check(peer, nonce(1000 + i, i as u32), 1000 + i).unwrap();
        }
        let state = guard.peers.get(&peer).unwrap();
        assert_eq!(state.seen.len(), NONCE_WINDOW);
        assert_eq!(state.order.len(), NONCE_WINDOW);
    }

    #[test]
    fn test_peers_are_independent() {
        let mut guard = ReplayGuard::new();
        let a = PeerId::from_bytes([1; 4]);
        let b = PeerId::from_bytes([2; 4]);
        let n = nonce(5000, 7);
        guard.check(a, n, 5000).unwrap();
        guard.check(b, n, 5000).unwrap();
    }

    #[test]
    fn test_forget_resets_peer() {
        let mut guard = ReplayGuard::new();
        let peer = PeerId::from_bytes([1; 4]);
        let n = nonce(5000, 7);
        guard.check(peer, n, 5000).unwrap();
        guard.forget(peer);
        guard.check(peer, n, 5000).unwrap();
    }
}
