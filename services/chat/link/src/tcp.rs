//! TCP transport.
//!
//! Frames are length-prefixed (u16, big-endian) and capped at the mesh
//! MTU. Each connection opens with a 4-byte peer id exchange so both
//! ends can key the link before any frame flows.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use whisper_wire::{PeerId, MAX_PACKET};

use crate::error::LinkError;
use crate::transport::{Transport, TransportEvent, EVENT_CHANNEL_DEPTH};

const WRITE_QUEUE_DEPTH: usize = 64;

struct Conn {
    tx: mpsc::Sender<Bytes>,
    reader: JoinHandle<()>,
}

struct Shared {
    local: PeerId,
    conns: DashMap<PeerId, Conn>,
    events: mpsc::Sender<TransportEvent>,
}

impl Shared {
    /// Take ownership of a handshaken stream and run its read/write loops.
    fn register(self: &Arc<Self>, peer: PeerId, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();

        let (tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        tokio::spawn(write_loop(peer, write_half, writer_rx));

        let shared = Arc::clone(self);
        let reader = tokio::spawn(async move {
            shared.read_loop(peer, read_half).await;
            shared.conns.remove(&peer);
            let _ = shared.events.try_send(TransportEvent::LinkClosed { peer });
        });

        if let Some(stale) = self.conns.insert(peer, Conn { tx, reader }) {
            stale.reader.abort();
        }
        debug!(peer = %peer, "tcp link up");
        let _ = self.events.try_send(TransportEvent::Connected { peer });
    }

    async fn read_loop(&self, peer: PeerId, mut read_half: OwnedReadHalf) {
        loop {
            let mut len = [0u8; 2];
            if read_half.read_exact(&mut len).await.is_err() {
                break;
            }
            let len = u16::from_be_bytes(len) as usize;
            if len > MAX_PACKET {
                warn!(peer = %peer, len, "oversized frame, closing link");
                break;
            }
            let mut frame = vec![0u8; len];
            if read_half.read_exact(&mut frame).await.is_err() {
                break;
            }
            if self
                .events
                .send(TransportEvent::Frame {
                    peer,
                    bytes: Bytes::from(frame),
                })
                .await
                .is_err()
            {
                break;
            }
        }
        debug!(peer = %peer, "tcp read loop ended");
    }

    /// Handshake an inbound stream: exchange 4-byte peer ids.
    async fn admit(self: &Arc<Self>, mut stream: TcpStream) -> Result<(), LinkError> {
        stream.write_all(self.local.as_bytes()).await?;
        let mut id = [0u8; 4];
        stream.read_exact(&mut id).await?;
        self.register(PeerId(id), stream);
        Ok(())
    }
}

async fn write_loop(peer: PeerId, mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        let len = (frame.len() as u16).to_be_bytes();
        if write_half.write_all(&len).await.is_err() || write_half.write_all(&frame).await.is_err()
        {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
    debug!(peer = %peer, "tcp write loop ended");
}

/// Length-prefixed TCP transport.
pub struct TcpTransport {
    addrs: DashMap<PeerId, String>,
    local_addr: std::net::SocketAddr,
    shared: Arc<Shared>,
}

impl TcpTransport {
    /// Bind the listener and start accepting inbound links.
    pub async fn bind(
        local: PeerId,
        listen_addr: &str,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), LinkError> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, peer = %local, "mesh listener bound");

        let (events, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let shared = Arc::new(Shared {
            local,
            conns: DashMap::new(),
            events,
        });

        let accept = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!(%addr, "inbound connection");
                        let shared = Arc::clone(&accept);
                        tokio::spawn(async move {
                            if let Err(err) = shared.admit(stream).await {
                                warn!(%addr, error = %err, "inbound handshake failed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                addrs: DashMap::new(),
                local_addr,
                shared,
            },
            rx,
        ))
    }

    /// The address the listener actually bound
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Register a peer's address for outbound connects.
    pub fn add_peer(&self, peer: PeerId, addr: String) {
        self.addrs.insert(peer, addr.clone());
        let _ = self
            .shared
            .events
            .try_send(TransportEvent::PeerDiscovered { peer, addr });
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, peer: PeerId) -> Result<(), LinkError> {
        if self.shared.conns.contains_key(&peer) {
            return Ok(());
        }
        let addr = self
            .addrs
            .get(&peer)
            .map(|entry| entry.clone())
            .ok_or(LinkError::UnknownPeer(peer))?;

        let mut stream = TcpStream::connect(&addr).await?;
        stream.write_all(self.shared.local.as_bytes()).await?;
        let mut id = [0u8; 4];
        stream.read_exact(&mut id).await?;
        let remote = PeerId(id);
        if remote != peer {
            warn!(expected = %peer, got = %remote, %addr, "peer id mismatch");
            return Err(LinkError::UnknownPeer(peer));
        }

        self.shared.register(peer, stream);
        Ok(())
    }

    async fn send(&self, peer: PeerId, bytes: Bytes) -> Result<(), LinkError> {
        if bytes.len() > self.mtu() {
            return Err(LinkError::Mtu {
                size: bytes.len(),
                mtu: self.mtu(),
            });
        }
        let tx = self
            .shared
            .conns
            .get(&peer)
            .map(|conn| conn.tx.clone())
            .ok_or(LinkError::NotConnected(peer))?;
        tx.send(bytes).await.map_err(|_| LinkError::ChannelClosed)
    }

    async fn disconnect(&self, peer: PeerId) -> Result<(), LinkError> {
        if let Some((_, conn)) = self.shared.conns.remove(&peer) {
            conn.reader.abort();
            let _ = self
                .shared
                .events
                .try_send(TransportEvent::LinkClosed { peer });
        }
        Ok(())
    }

    fn mtu(&self) -> usize {
        MAX_PACKET
    }

    fn set_duty_cycle(&self, fraction: f32) {
        debug!(fraction, "duty cycle hint ignored by tcp transport");
    }
}
