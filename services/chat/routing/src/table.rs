//! Advisory route table.
//!
//! Learned from routing advertisements, the table biases unicast
//! forwarding toward the advertised next hop. Misses simply fall back to
//! flooding, so entries are best-effort and aggressively bounded.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use whisper_wire::{PeerId, MAX_TTL};

/// Maximum routes held
pub const MAX_ROUTES: usize = 256;

/// Default age after which a route is pruned
pub const DEFAULT_ROUTE_TTL: Duration = Duration::from_secs(120);

/// One learned route.
#[derive(Debug, Clone, Copy)]
pub struct Route {
    /// Neighbor to hand the packet to
    pub next_hop: PeerId,
    /// Advertised hops from the next hop to the destination
    pub hop_metric: u8,
    /// When the route was last refreshed
    pub updated: Instant,
}

/// Concurrent best-effort route table, bounded at [`MAX_ROUTES`].
pub struct RouteTable {
    routes: DashMap<PeerId, Route>,
    route_ttl: Duration,
}

impl RouteTable {
    /// Create a table with the default route lifetime
    pub fn new() -> Self {
        Self::with_route_ttl(DEFAULT_ROUTE_TTL)
    }

    /// Create a table with an explicit route lifetime
    pub fn with_route_ttl(route_ttl: Duration) -> Self {
        Self {
            routes: DashMap::new(),
            route_ttl,
        }
    }

    /// Learn or refresh a route.
    ///
    /// A fresh advertisement replaces an existing entry when its metric
    /// is no worse. Out-of-range metrics are ignored. When the table is
    /// full the stalest route is evicted.
    pub fn learn(&self, dest: PeerId, next_hop: PeerId, hop_metric: u8) {
        if hop_metric > MAX_TTL || dest.is_broadcast() {
            return;
        }
        if let Some(existing) = self.routes.get(&dest) {
            if existing.hop_metric < hop_metric && existing.updated.elapsed() < self.route_ttl {
                return;
            }
        }
        if self.routes.len() >= MAX_ROUTES && !self.routes.contains_key(&dest) {
            self.evict_stalest();
        }
        debug!(dest = %dest, next_hop = %next_hop, hop_metric, "route learned");
        self.routes.insert(
            dest,
            Route {
                next_hop,
                hop_metric,
                updated: Instant::now(),
            },
        );
    }

    /// Look up the preferred next hop for a destination.
    pub fn next_hop(&self, dest: PeerId) -> Option<PeerId> {
        self.routes.get(&dest).and_then(|route| {
            if route.updated.elapsed() < self.route_ttl {
                Some(route.next_hop)
            } else {
                None
            }
        })
    }

    /// Drop every route through a vanished neighbor.
    pub fn purge_next_hop(&self, next_hop: PeerId) {
        self.routes.retain(|_, route| route.next_hop != next_hop);
    }

    /// Drop routes past their lifetime, returning how many.
    pub fn prune(&self) -> usize {
        let before = self.routes.len();
        let route_ttl = self.route_ttl;
        self.routes
            .retain(|_, route| route.updated.elapsed() < route_ttl);
        before - self.routes.len()
    }

    /// Snapshot of destinations and their routes, for advertisements.
    pub fn snapshot(&self) -> Vec<(PeerId, Route)> {
        self.routes
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Number of live routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn evict_stalest(&self) {
        let stalest = self
            .routes
            .iter()
            .min_by_key(|entry| entry.value().updated)
            .map(|entry| *entry.key());
        if let Some(stalest) = stalest {
            self.routes.remove(&stalest);
        }
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b, 0, 0, 0])
    }

    #[test]
    fn test_learn_and_lookup() {
        let table = RouteTable::new();
        table.learn(peer(1), peer(2), 3);
        assert_eq!(table.next_hop(peer(1)), Some(peer(2)));
        assert_eq!(table.next_hop(peer(9)), None);
    }

    #[test]
    fn test_better_metric_wins() {
        let table = RouteTable::new();
        table.learn(peer(1), peer(2), 3);
        table.learn(peer(1), peer(3), 1);
        assert_eq!(table.next_hop(peer(1)), Some(peer(3)));
        // A worse metric does not displace a fresh route.
        table.learn(peer(1), peer(4), 5);
        assert_eq!(table.next_hop(peer(1)), Some(peer(3)));
    }

    #[test]
    fn test_rejects_bad_metric_and_broadcast() {
        let table = RouteTable::new();
        table.learn(peer(1), peer(2), 8);
        table.learn(PeerId::BROADCAST, peer(2), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_purge_next_hop() {
        let table = RouteTable::new();
        table.learn(peer(1), peer(2), 1);
        table.learn(peer(3), peer(2), 2);
        table.learn(peer(4), peer(5), 1);
        table.purge_next_hop(peer(2));
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_hop(peer(4)), Some(peer(5)));
    }

    #[test]
    fn test_prune_expired() {
        let table = RouteTable::with_route_ttl(Duration::ZERO);
        table.learn(peer(1), peer(2), 1);
        assert_eq!(table.next_hop(peer(1)), None);
        assert_eq!(table.prune(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_capacity_evicts_stalest() {
        let table = RouteTable::new();
        for i in 0..MAX_ROUTES {
            table.learn(
                PeerId::from_bytes((i as u32 + 1).to_be_bytes()),
                peer(9),
                1,
            );
        }
        assert_eq!(table.len(), MAX_ROUTES);
        table.learn(PeerId::from_bytes([0xFF; 4]), peer(9), 1);
        assert_eq!(table.len(), MAX_ROUTES);
        assert_eq!(table.next_hop(PeerId::from_bytes([0xFF; 4])), Some(peer(9)));
    }
}
