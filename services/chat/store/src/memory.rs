//! In-memory store backend.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use whisper_wire::PeerId;

use crate::{MessageStore, StoreError};

/// Default packets parked per recipient
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

/// Default retention before a parked packet is dropped
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

struct Parked {
    packet: Bytes,
    queued_at: Instant,
}

/// Volatile offline store backed by per-recipient deques.
pub struct MemoryStore {
    queues: DashMap<PeerId, VecDeque<Parked>>,
    queue_depth: usize,
    retention: Duration,
}

impl MemoryStore {
    /// Create a store with default bounds
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_QUEUE_DEPTH, DEFAULT_RETENTION)
    }

    /// Create a store with explicit bounds
    pub fn with_limits(queue_depth: usize, retention: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            queue_depth,
            retention,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn enqueue(&self, recipient: PeerId, packet: Bytes) -> Result<(), StoreError> {
        let mut queue = self.queues.entry(recipient).or_default();
        if queue.len() >= self.queue_depth {
            queue.pop_front();
            warn!(recipient = %recipient, "offline queue full, dropped oldest");
        }
        queue.push_back(Parked {
            packet,
            queued_at: Instant::now(),
        });
        debug!(recipient = %recipient, depth = queue.len(), "packet parked");
        Ok(())
    }

    async fn drain(&self, recipient: PeerId) -> Result<Vec<Bytes>, StoreError> {
        let Some((_, queue)) = self.queues.remove(&recipient) else {
            return Ok(Vec::new());
        };
        let retention = self.retention;
        let packets: Vec<Bytes> = queue
            .into_iter()
            .filter(|parked| parked.queued_at.elapsed() < retention)
            .map(|parked| parked.packet)
            .collect();
        if !packets.is_empty() {
            debug!(recipient = %recipient, count = packets.len(), "draining parked packets");
        }
        Ok(packets)
    }

    async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let retention = self.retention;
        let mut dropped = 0;
        for mut entry in self.queues.iter_mut() {
            let before = entry.len();
            entry.retain(|parked| parked.queued_at.elapsed() < retention);
            dropped += before - entry.len();
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        if dropped > 0 {
            debug!(dropped, "swept expired parked packets");
        }
        Ok(dropped)
    }

    async fn pending(&self, recipient: PeerId) -> usize {
        self.queues
            .get(&recipient)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    async fn clear(&self) {
        self.queues.clear();
    }
}
