//! Link pool management.
//!
//! The manager owns every neighbor link: dialing runs in spawned tasks
//! with bounded retries, each live link gets an outbound queue drained
//! by its own worker, the pool is capped with least-recently-active
//! eviction, and suspend/resume tears the pool down and rebuilds it.
//!
//! Nothing here blocks the caller: `dial` returns once the attempt is
//! in flight and `send_to`/`broadcast` only enqueue. Failures come back
//! asynchronously as [`LinkEvent`]s on the receiver handed out by
//! [`LinkManager::new`], carrying the undelivered frame where there is
//! one so the caller can reroute it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use whisper_wire::PeerId;

use crate::error::LinkError;
use crate::link::{Link, LinkState};
use crate::transport::Transport;

/// Default maximum simultaneous links
pub const DEFAULT_MAX_LINKS: usize = 8;

/// Connect attempts before giving up
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Backoff before the second connect attempt; doubles per attempt
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Send attempts per frame before the frame is reported undeliverable
pub const SEND_ATTEMPTS: u32 = 3;

/// Backoff before the second send attempt; doubles per attempt
pub const SEND_BACKOFF: Duration = Duration::from_secs(1);

/// Frames buffered per link while its worker retries
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Capacity of the link event channel
const LINK_EVENT_DEPTH: usize = 64;

/// Asynchronous outcomes of dial and send operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Every connect attempt to the peer failed
    DialFailed {
        /// The peer that could not be reached
        peer: PeerId,
    },
    /// A frame could not be delivered after all retries
    SendFailed {
        /// The peer the frame was bound for
        peer: PeerId,
        /// The undelivered frame
        frame: Bytes,
    },
}

struct Outbound {
    tx: mpsc::Sender<Bytes>,
    worker: JoinHandle<()>,
}

/// Owns the neighbor link pool on top of a [`Transport`].
pub struct LinkManager {
    transport: Arc<dyn Transport>,
    links: HashMap<PeerId, Link>,
    outbound: HashMap<PeerId, Outbound>,
    events_tx: mpsc::Sender<LinkEvent>,
    max_links: usize,
    suspended: bool,
}

impl LinkManager {
    /// Create a manager over a transport, returning its event stream
    pub fn new(
        transport: Arc<dyn Transport>,
        max_links: usize,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_DEPTH);
        (
            Self {
                transport,
                links: HashMap::new(),
                outbound: HashMap::new(),
                events_tx,
                max_links,
                suspended: false,
            },
            events_rx,
        )
    }

    /// The underlying transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Start dialing a peer.
    ///
    /// The attempt runs in its own task with bounded retries and
    /// exponential backoff; success surfaces as the transport's
    /// `Connected` event and exhaustion as [`LinkEvent::DialFailed`].
    pub async fn dial(&mut self, peer: PeerId) {
        if self.suspended {
            return;
        }
        if self
            .links
            .get(&peer)
            .map(|l| l.is_up() || l.state == LinkState::Connecting)
            .unwrap_or(false)
        {
            return;
        }
        self.make_room(peer).await;
        let link = self.links.entry(peer).or_insert_with(|| Link::new(peer));
        link.advance(LinkState::Connecting);

        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mut backoff = CONNECT_BACKOFF;
            for attempt in 1..=CONNECT_ATTEMPTS {
                match transport.connect(peer).await {
                    // The transport reports the link up on its own event
                    // channel; nothing more to do here.
                    Ok(()) => return,
                    Err(err) => {
                        warn!(peer = %peer, attempt, error = %err, "dial attempt failed");
                        if attempt < CONNECT_ATTEMPTS {
                            sleep(backoff).await;
                            backoff *= 2;
                        }
                    }
                }
            }
            let _ = events.send(LinkEvent::DialFailed { peer }).await;
        });
    }

    /// A spawned dial task exhausted its attempts.
    pub fn on_dial_failed(&mut self, peer: PeerId) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.failures += 1;
            link.advance(LinkState::Failed);
        }
    }

    /// Transport reported the link up (inbound or outbound).
    pub fn on_connected(&mut self, peer: PeerId) {
        let link = self.links.entry(peer).or_insert_with(|| Link::new(peer));
        link.failures = 0;
        link.advance(LinkState::Connected);
        self.ensure_outbound(peer);
    }

    /// Peer's discovery announcement arrived; verification in progress.
    pub fn on_authenticating(&mut self, peer: PeerId) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.advance(LinkState::Authenticating);
        }
    }

    /// Peer's announcement signature verified.
    pub fn on_authenticated(&mut self, peer: PeerId) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.advance(LinkState::Authenticated);
        }
    }

    /// Transport reported the link down.
    pub fn on_closed(&mut self, peer: PeerId) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.advance(LinkState::Disconnected);
        }
        self.drop_outbound(peer);
    }

    /// Note traffic on a link, refreshing its activity clock.
    pub fn on_activity(&mut self, peer: PeerId) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.touch();
        }
    }

    /// Queue one frame for a specific neighbor.
    ///
    /// The link's worker delivers it with retries; if every attempt
    /// fails the frame comes back as [`LinkEvent::SendFailed`].
    pub fn send_to(&mut self, peer: PeerId, bytes: Bytes) -> Result<(), LinkError> {
        if bytes.len() > self.transport.mtu() {
            return Err(LinkError::Mtu {
                size: bytes.len(),
                mtu: self.transport.mtu(),
            });
        }
        if !self.links.get(&peer).map(|l| l.is_up()).unwrap_or(false) {
            return Err(LinkError::NotConnected(peer));
        }
        let outbound = self
            .outbound
            .get(&peer)
            .ok_or(LinkError::NotConnected(peer))?;
        match outbound.tx.try_send(bytes) {
            Ok(()) => {
                self.on_activity(peer);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(LinkError::QueueFull(peer)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LinkError::NotConnected(peer)),
        }
    }

    /// Fan a frame out over every live link except `except`.
    ///
    /// Each link's worker delivers its copy independently; one slow or
    /// dead neighbor never blocks the rest. Returns how many links
    /// accepted the frame.
    pub fn broadcast(&mut self, bytes: Bytes, except: Option<PeerId>) -> usize {
        let targets: Vec<PeerId> = self
            .links
            .values()
            .filter(|link| link.is_up() && Some(link.peer) != except)
            .map(|link| link.peer)
            .collect();

        let mut sent = 0;
        for peer in targets {
            match self.send_to(peer, bytes.clone()) {
                Ok(()) => sent += 1,
                Err(err) => debug!(peer = %peer, error = %err, "broadcast leg not queued"),
            }
        }
        sent
    }

    /// Peers with a live link
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.links
            .values()
            .filter(|link| link.is_up())
            .map(|link| link.peer)
            .collect()
    }

    /// Link state for a peer, if tracked
    pub fn state(&self, peer: PeerId) -> Option<LinkState> {
        self.links.get(&peer).map(|link| link.state)
    }

    /// Disconnect links idle past `timeout`, returning the peers cut.
    pub async fn sweep_idle(&mut self, timeout: Duration) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .links
            .values()
            .filter(|link| link.is_stale(timeout))
            .map(|link| link.peer)
            .collect();
        for peer in &stale {
            debug!(peer = %peer, "disconnecting idle link");
            let _ = self.transport.disconnect(*peer).await;
            self.on_closed(*peer);
        }
        stale
    }

    /// Drop every link but remember the peers, for later resume.
    pub async fn suspend(&mut self) {
        info!("suspending link pool");
        self.suspended = true;
        let peers: Vec<PeerId> = self.connected_peers();
        for peer in peers {
            let _ = self.transport.disconnect(peer).await;
            self.on_closed(peer);
        }
    }

    /// Start redialing the remembered peers after a suspend.
    pub async fn resume(&mut self) {
        info!("resuming link pool");
        self.suspended = false;
        let peers: Vec<PeerId> = self.links.keys().copied().collect();
        for peer in peers {
            self.dial(peer).await;
        }
    }

    /// Pass a duty-cycle hint to the transport.
    pub fn set_duty_cycle(&self, fraction: f32) {
        self.transport.set_duty_cycle(fraction);
    }

    fn ensure_outbound(&mut self, peer: PeerId) {
        if self.outbound.contains_key(&peer) {
            return;
        }
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let worker = tokio::spawn(outbound_worker(
            Arc::clone(&self.transport),
            peer,
            rx,
            self.events_tx.clone(),
        ));
        self.outbound.insert(peer, Outbound { tx, worker });
    }

    fn drop_outbound(&mut self, peer: PeerId) {
        if let Some(outbound) = self.outbound.remove(&peer) {
            outbound.worker.abort();
        }
    }

    async fn make_room(&mut self, incoming: PeerId) {
        if self.links.contains_key(&incoming) || self.links.len() < self.max_links {
            return;
        }
        let Some(victim) = self
            .links
            .values()
            .min_by_key(|link| link.last_active)
            .map(|link| link.peer)
        else {
            return;
        };
        warn!(victim = %victim, "link pool full, evicting least recently active");
        let _ = self.transport.disconnect(victim).await;
        self.drop_outbound(victim);
        self.links.remove(&victim);
    }
}

/// Drains one link's queue, retrying each frame with backoff.
///
/// Exhausting the retries reports the frame as undeliverable and ends
/// the worker; the link is torn down by whoever handles the event.
async fn outbound_worker(
    transport: Arc<dyn Transport>,
    peer: PeerId,
    mut frames: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<LinkEvent>,
) {
    while let Some(frame) = frames.recv().await {
        let mut backoff = SEND_BACKOFF;
        let mut delivered = false;
        for attempt in 1..=SEND_ATTEMPTS {
            match transport.send(peer, frame.clone()).await {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(err) => {
                    debug!(peer = %peer, attempt, error = %err, "send attempt failed");
                    if attempt < SEND_ATTEMPTS {
                        sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        if !delivered {
            warn!(peer = %peer, "send retries exhausted");
            let _ = events.send(LinkEvent::SendFailed { peer, frame }).await;
            return;
        }
    }
}
