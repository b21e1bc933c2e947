//! Duplicate suppression for flooded packets.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use whisper_wire::PeerId;

/// Default number of flood ids remembered
pub const DEFAULT_CAPACITY: usize = 4096;

/// Default retention window for flood ids
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// Bounded set of recently seen `(source, flood_id)` pairs.
///
/// Insertion order doubles as eviction order: when full, the oldest
/// entry goes first, and [`SeenSet::prune`] drops entries past the
/// retention window.
pub struct SeenSet {
    entries: HashMap<(PeerId, u64), Instant>,
    order: VecDeque<(PeerId, u64)>,
    capacity: usize,
    retention: Duration,
}

impl SeenSet {
    /// Create a set with explicit bounds
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            retention,
        }
    }

    /// Record a flood id; returns `true` if it was already present.
    pub fn check_and_insert(&mut self, source: PeerId, flood_id: u64) -> bool {
        let key = (source, flood_id);
        if self.entries.contains_key(&key) {
            return true;
        }
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, Instant::now());
        self.order.push_back(key);
        false
    }

    /// Drop entries past the retention window, returning how many.
    pub fn prune(&mut self) -> usize {
        let retention = self.retention;
        let before = self.entries.len();
        self.entries.retain(|_, seen_at| seen_at.elapsed() < retention);
        let entries = &self.entries;
        self.order.retain(|key| entries.contains_key(key));
        before - self.entries.len()
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sighting_is_new() {
        let mut seen = SeenSet::default();
        let peer = PeerId::from_bytes([1; 4]);
        assert!(!seen.check_and_insert(peer, 42));
        assert!(seen.check_and_insert(peer, 42));
    }

    #[test]
    fn test_sources_do_not_collide() {
        let mut seen = SeenSet::default();
        assert!(!seen.check_and_insert(PeerId::from_bytes([1; 4]), 42));
        assert!(!seen.check_and_insert(PeerId::from_bytes([2; 4]), 42));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut seen = SeenSet::new(2, DEFAULT_RETENTION);
        let peer = PeerId::from_bytes([1; 4]);
        seen.check_and_insert(peer, 1);
        seen.check_and_insert(peer, 2);
        seen.check_and_insert(peer, 3);
        assert_eq!(seen.len(), 2);
        // id 1 was evicted and reads as new again
        assert!(!seen.check_and_insert(peer, 1));
    }

    #[test]
    fn test_prune_by_age() {
        let mut seen = SeenSet::new(16, Duration::ZERO);
        let peer = PeerId::from_bytes([1; 4]);
        seen.check_and_insert(peer, 1);
        assert_eq!(seen.prune(), 1);
        assert!(seen.is_empty());
    }
}
