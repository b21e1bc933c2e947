//! In-process transport for tests and single-machine meshes.
//!
//! A [`MemoryHub`] plays the role of the shared medium: peers attach to
//! it, wiring declares which pairs are in radio range, and frames move
//! over tokio channels. Nothing here touches the network.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use whisper_wire::{PeerId, MAX_PACKET};

use crate::error::LinkError;
use crate::transport::{Transport, TransportEvent, EVENT_CHANNEL_DEPTH};

fn pair(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

struct HubInner {
    members: DashMap<PeerId, mpsc::Sender<TransportEvent>>,
    wired: DashMap<(PeerId, PeerId), ()>,
    connected: DashMap<(PeerId, PeerId), ()>,
}

impl HubInner {
    fn emit(&self, to: PeerId, event: TransportEvent) {
        if let Some(sender) = self.members.get(&to) {
            // Receivers that fell behind lose events, like a real radio.
            let _ = sender.try_send(event);
        }
    }
}

/// Shared medium connecting [`MemoryTransport`] instances.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                members: DashMap::new(),
                wired: DashMap::new(),
                connected: DashMap::new(),
            }),
        }
    }

    /// Attach a peer, returning its transport and event stream
    pub fn attach(&self, local: PeerId) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        self.inner.members.insert(local, tx);
        (
            MemoryTransport {
                local,
                hub: Arc::clone(&self.inner),
            },
            rx,
        )
    }

    /// Put two peers in range of each other.
    ///
    /// Both sides get a `PeerDiscovered` event if already attached.
    pub fn wire(&self, a: PeerId, b: PeerId) {
        self.inner.wired.insert(pair(a, b), ());
        self.inner.emit(
            a,
            TransportEvent::PeerDiscovered {
                peer: b,
                addr: b.to_string(),
            },
        );
        self.inner.emit(
            b,
            TransportEvent::PeerDiscovered {
                peer: a,
                addr: a.to_string(),
            },
        );
    }

    /// Take two peers out of range, closing any live link.
    pub fn unwire(&self, a: PeerId, b: PeerId) {
        self.inner.wired.remove(&pair(a, b));
        if self.inner.connected.remove(&pair(a, b)).is_some() {
            self.inner.emit(a, TransportEvent::LinkClosed { peer: b });
            self.inner.emit(b, TransportEvent::LinkClosed { peer: a });
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    local: PeerId,
    hub: Arc<HubInner>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, peer: PeerId) -> Result<(), LinkError> {
        if !self.hub.members.contains_key(&peer)
            || !self.hub.wired.contains_key(&pair(self.local, peer))
        {
            return Err(LinkError::UnknownPeer(peer));
        }
        if self
            .hub
            .connected
            .insert(pair(self.local, peer), ())
            .is_none()
        {
            debug!(local = %self.local, peer = %peer, "memory link up");
            self.hub
                .emit(self.local, TransportEvent::Connected { peer });
            self.hub
                .emit(peer, TransportEvent::Connected { peer: self.local });
        }
        Ok(())
    }

    async fn send(&self, peer: PeerId, bytes: Bytes) -> Result<(), LinkError> {
        if bytes.len() > self.mtu() {
            return Err(LinkError::Mtu {
                size: bytes.len(),
                mtu: self.mtu(),
            });
        }
        if !self.hub.connected.contains_key(&pair(self.local, peer)) {
            return Err(LinkError::NotConnected(peer));
        }
        let sender = self
            .hub
            .members
            .get(&peer)
            .ok_or(LinkError::NotConnected(peer))?
            .clone();
        trace!(local = %self.local, peer = %peer, len = bytes.len(), "memory frame");
        sender
            .send(TransportEvent::Frame {
                peer: self.local,
                bytes,
            })
            .await
            .map_err(|_| LinkError::ChannelClosed)
    }

    async fn disconnect(&self, peer: PeerId) -> Result<(), LinkError> {
        if self
            .hub
            .connected
            .remove(&pair(self.local, peer))
            .is_some()
        {
            self.hub
                .emit(self.local, TransportEvent::LinkClosed { peer });
            self.hub
                .emit(peer, TransportEvent::LinkClosed { peer: self.local });
        }
        Ok(())
    }

    fn mtu(&self) -> usize {
        MAX_PACKET
    }

    fn set_duty_cycle(&self, fraction: f32) {
        trace!(fraction, "duty cycle hint ignored by memory transport");
    }
}
