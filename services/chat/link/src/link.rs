//! Per-neighbor link bookkeeping.

use std::time::{Duration, Instant};

use tracing::trace;

use whisper_wire::PeerId;

/// Lifecycle of a neighbor link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection
    Disconnected,
    /// Transport connect in flight
    Connecting,
    /// Transport link up, peer not yet verified
    Connected,
    /// Discovery announcement received, signature pending verification
    Authenticating,
    /// Peer verified; full traffic flows
    Authenticated,
    /// Gave up after repeated failures
    Failed,
}

/// State kept for one neighbor.
#[derive(Debug, Clone)]
pub struct Link {
    /// The neighbor
    pub peer: PeerId,
    /// Current lifecycle state
    pub state: LinkState,
    /// Last time any traffic or state change touched the link
    pub last_active: Instant,
    /// Consecutive connect failures
    pub failures: u32,
}

impl Link {
    /// Track a new neighbor, initially disconnected
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            state: LinkState::Disconnected,
            last_active: Instant::now(),
            failures: 0,
        }
    }

    /// Move to a new state and refresh the activity clock
    pub fn advance(&mut self, state: LinkState) {
        if self.state != state {
            trace!(peer = %self.peer, from = ?self.state, to = ?state, "link state");
        }
        self.state = state;
        self.touch();
    }

    /// Refresh the activity clock
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Whether traffic may flow
    pub fn is_up(&self) -> bool {
        matches!(
            self.state,
            LinkState::Connected | LinkState::Authenticating | LinkState::Authenticated
        )
    }

    /// Whether the link has gone quiet past `idle`
    pub fn is_stale(&self, idle: Duration) -> bool {
        self.is_up() && self.last_active.elapsed() >= idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut link = Link::new(PeerId::from_bytes([1; 4]));
        assert!(!link.is_up());
        link.advance(LinkState::Connecting);
        assert!(!link.is_up());
        link.advance(LinkState::Connected);
        assert!(link.is_up());
        link.advance(LinkState::Authenticated);
        assert!(link.is_up());
        link.advance(LinkState::Disconnected);
        assert!(!link.is_up());
    }

    #[test]
    fn test_staleness() {
        let mut link = Link::new(PeerId::from_bytes([1; 4]));
        link.advance(LinkState::Authenticated);
        assert!(!link.is_stale(Duration::from_secs(60)));
        assert!(link.is_stale(Duration::ZERO));
    }
}
