//! The node event loop.
//!
//! [`MeshNode`] owns every layer (crypto engine, router, fragmenter,
//! links, peer registry, offline store) and runs them from a single
//! select loop over transport events, link events, application
//! commands, and the maintenance clocks. Nothing else holds the state,
//! so no locks. Sends only enqueue; the link layer delivers in its own
//! tasks and reports failures back through the link event stream.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use whisper_crypto::{
    sealed_nonce, sealed_timestamp, ChannelKeyring, CryptoEngine, Identity, ReplayGuard,
};
use whisper_link::{LinkEvent, LinkManager, Transport, TransportEvent};
use whisper_routing::{MeshRouter, RouteAction};
use whisper_store::MessageStore;
use whisper_wire::{
    AckPayload, ChannelPayload, DiscoveryPayload, Fragmenter, MessageType, Packet, PacketFlags,
    PayloadKind, PeerId, PrivatePayload, Reassembler,
};

use crate::error::NodeError;
use crate::handle::{AppEvent, Command, MessageContext, NodeHandle};
use crate::peers::PeerRegistry;

/// Unacked private messages whose plaintext is kept for rerouting
const MAX_PENDING_ACKS: usize = 256;

/// Node tunables.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Nickname announced in discovery
    pub nickname: String,
    /// Maximum simultaneous links
    pub max_links: usize,
    /// Cadence of discovery and routing announcements
    pub advert_interval: Duration,
    /// Cadence of the maintenance sweep
    pub sweep_interval: Duration,
    /// Partial fragment buffers older than this are dropped
    pub fragment_timeout: Duration,
    /// Peers silent past this are reported lost
    pub peer_timeout: Duration,
    /// Links idle past this are disconnected
    pub link_idle_timeout: Duration,
    /// Application event queue depth
    pub event_depth: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nickname: "whisper".into(),
            max_links: whisper_link::DEFAULT_MAX_LINKS,
            advert_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            fragment_timeout: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(90),
            link_idle_timeout: Duration::from_secs(120),
            event_depth: 256,
        }
    }
}

/// One mesh participant: state, crypto, and the event loop.
pub struct MeshNode {
    me: PeerId,
    config: NodeConfig,
    engine: CryptoEngine,
    channels: ChannelKeyring,
    replay: ReplayGuard,
    router: MeshRouter,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    links: LinkManager,
    peers: PeerRegistry,
    store: Arc<dyn MessageStore>,
    pending_acks: HashMap<u64, (PeerId, String)>,
    pending_order: VecDeque<u64>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    link_rx: mpsc::Receiver<LinkEvent>,
    commands_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<AppEvent>,
}

impl MeshNode {
    /// Assemble a node from its parts.
    ///
    /// Returns the node (drive it with [`MeshNode::run`]), the command
    /// handle, and the application event stream.
    pub fn new(
        identity: Identity,
        transport: Arc<dyn Transport>,
        transport_rx: mpsc::Receiver<TransportEvent>,
        store: Arc<dyn MessageStore>,
        config: NodeConfig,
    ) -> (Self, NodeHandle, mpsc::Receiver<AppEvent>) {
        let me = identity.peer_id();
        let (events_tx, events_rx) = mpsc::channel(config.event_depth);
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (links, link_rx) = LinkManager::new(transport, config.max_links);

        let node = Self {
            me,
            links,
            config,
            engine: CryptoEngine::new(identity),
            channels: ChannelKeyring::new(),
            replay: ReplayGuard::new(),
            router: MeshRouter::new(me),
            fragmenter: Fragmenter::new(rand::random()),
            reassembler: Reassembler::default(),
            peers: PeerRegistry::new(),
            store,
            pending_acks: HashMap::new(),
            pending_order: VecDeque::new(),
            transport_rx,
            link_rx,
            commands_rx,
            events_tx,
        };
        (
            node,
            NodeHandle {
                commands: commands_tx,
            },
            events_rx,
        )
    }

    /// This node's peer id
    pub fn peer_id(&self) -> PeerId {
        self.me
    }

    /// Drive the node until shutdown.
    pub async fn run(mut self) {
        info!(peer = %self.me, nickname = %self.config.nickname, "node running");
        let mut advert = interval(self.config.advert_interval);
        advert.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe = self.transport_rx.recv() => match maybe {
                    Some(event) => self.on_transport(event).await,
                    None => break,
                },
                maybe = self.link_rx.recv() => match maybe {
                    Some(event) => self.on_link_event(event).await,
                    None => break,
                },
                maybe = self.commands_rx.recv() => match maybe {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                _ = advert.tick() => self.announce(),
                _ = sweep.tick() => self.maintain().await,
            }
        }
        info!(peer = %self.me, "node stopped");
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerDiscovered { peer, addr } => {
                trace!(peer = %peer, %addr, "transport discovered peer");
                self.links.dial(peer).await;
            }
            TransportEvent::Connected { peer } => {
                self.links.on_connected(peer);
                self.send_discovery_to(peer);
            }
            TransportEvent::Frame { peer, bytes } => {
                self.links.on_activity(peer);
                self.peers.touch(peer);
                match Packet::decode(bytes) {
                    Ok(packet) => self.dispatch(packet, peer).await,
                    Err(err) => debug!(from = %peer, error = %err, "undecodable frame dropped"),
                }
            }
            TransportEvent::LinkClosed { peer } => {
                self.links.on_closed(peer);
                self.peer_lost(peer);
            }
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::DialFailed { peer } => {
                debug!(peer = %peer, "dial gave up");
                self.links.on_dial_failed(peer);
            }
            LinkEvent::SendFailed { peer, frame } => {
                warn!(peer = %peer, "link undeliverable, tearing it down");
                self.links.on_closed(peer);
                self.peer_lost(peer);
                self.recover_frame(frame).await;
            }
        }
    }

    /// Salvage an undeliverable frame.
    ///
    /// Our own unacked private messages are parked for the recipient's
    /// return; everything else (floods, relayed copies, fragments) has
    /// redundancy or retransmission elsewhere and is let go.
    async fn recover_frame(&mut self, frame: Bytes) {
        let Ok(packet) = Packet::decode(frame) else {
            return;
        };
        if packet.source != self.me || packet.typ != MessageType::Private {
            return;
        }
        let Ok(PayloadKind::Private(message)) = PayloadKind::decode(packet.typ, packet.payload)
        else {
            return;
        };
        let Some((recipient, content)) = self.pending_acks.remove(&message.message_id) else {
            return;
        };
        match self
            .store
            .enqueue(recipient, Bytes::from(content.into_bytes()))
            .await
        {
            Ok(()) => self.emit(AppEvent::DeliveryPending { recipient }),
            Err(err) => warn!(peer = %recipient, error = %err, "parking failed message failed"),
        }
    }

    async fn dispatch(&mut self, packet: Packet, from: PeerId) {
        match self.router.decide(&packet) {
            RouteAction::Deliver => self.deliver(packet, from).await,
            RouteAction::Forward {
                packet: copy,
                next_hop,
            } => self.retransmit(copy, next_hop, Some(from)),
            RouteAction::DeliverAndForward { packet: copy } => {
                self.retransmit(copy, None, Some(from));
                self.deliver(packet, from).await;
            }
            RouteAction::Drop(_) => {}
        }
    }

    async fn deliver(&mut self, packet: Packet, from: PeerId) {
        let kind = match PayloadKind::decode(packet.typ, packet.payload.clone()) {
            Ok(kind) => kind,
            Err(err) => {
                debug!(from = %packet.source, error = %err, "malformed payload dropped");
                return;
            }
        };
        match kind {
            PayloadKind::Discovery(announcement) => {
                self.on_discovery(packet.source, from, announcement).await;
            }
            PayloadKind::Channel(message) => self.on_channel(packet.source, message),
            PayloadKind::Private(message) => self.on_private(&packet, from, message).await,
            PayloadKind::Routing(advert) => self.router.apply_advert(from, &advert),
            PayloadKind::Ack(ack) => {
                self.pending_acks.remove(&ack.message_id);
                self.emit(AppEvent::Acked {
                    message_id: ack.message_id,
                });
            }
            PayloadKind::Fragment(body) => self.on_fragment(packet.source, body, from).await,
            PayloadKind::Ping => self.send_pong(from),
            PayloadKind::Pong => {}
        }
    }

    async fn on_discovery(&mut self, source: PeerId, from: PeerId, announcement: DiscoveryPayload) {
        self.links.on_authenticating(from);
        // Unchanged re-announcements must not reset an established
        // session's ratchet state; a new ephemeral key means the peer
        // restarted or dropped the session, so re-derive.
        if self.engine.needs_session(source, &announcement.exchange_key) {
            if let Err(err) =
                self.engine
                    .establish(source, &announcement.exchange_key, &announcement.signing_key)
            {
                warn!(peer = %source, error = %err, "session establishment failed");
                return;
            }
        }
        self.links.on_authenticated(from);

        let reappeared = self.peers.observe(source, &announcement);
        if !reappeared {
            return;
        }
        self.emit(AppEvent::PeerSeen {
            peer: source,
            nickname: announcement.nickname,
        });

        // Parked messages are plaintext; resending seals them under the
        // session that exists now, not the one that existed at parking.
        match self.store.drain(source).await {
            Ok(parked) => {
                for content in parked {
                    let text = String::from_utf8_lossy(&content).into_owned();
                    if let Err(err) = self.send_private(source, text).await {
                        warn!(peer = %source, error = %err, "parked message resend failed");
                    }
                }
            }
            Err(err) => warn!(peer = %source, error = %err, "offline store drain failed"),
        }
    }

    fn on_channel(&mut self, source: PeerId, message: ChannelPayload) {
        if !self.channels.is_member(&message.channel) {
            trace!(channel = %message.channel, "not a member, relay only");
            return;
        }
        let plaintext = match self
            .channels
            .open(&message.channel, source, &message.ciphertext)
        {
            Ok(plaintext) => plaintext,
            Err(err) => {
                debug!(channel = %message.channel, from = %source, error = %err, "channel open failed");
                return;
            }
        };
        if let Err(err) = self.replay_check(source, &message.ciphertext) {
            warn!(from = %source, error = %err, "channel message rejected");
            return;
        }
        let nickname = self.peers.get(source).map(|info| info.nickname.clone());
        self.emit(AppEvent::MessageReceived {
            sender: source,
            nickname,
            context: MessageContext::Channel(message.channel),
            content: String::from_utf8_lossy(&plaintext).into_owned(),
        });
    }

    async fn on_private(&mut self, packet: &Packet, from: PeerId, message: PrivatePayload) {
        let plaintext = match self.engine.open_private(packet.source, &message.ciphertext) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                debug!(from = %packet.source, error = %err, "private open failed");
                return;
            }
        };
        if let Err(err) = self.replay_check(packet.source, &message.ciphertext) {
            warn!(from = %packet.source, error = %err, "private message rejected");
            return;
        }
        let nickname = self
            .peers
            .get(packet.source)
            .map(|info| info.nickname.clone());
        self.emit(AppEvent::MessageReceived {
            sender: packet.source,
            nickname,
            context: MessageContext::Private,
            content: String::from_utf8_lossy(&plaintext).into_owned(),
        });

        if packet.flags.contains(PacketFlags::ACK) {
            let ack = Packet::new(
                MessageType::Ack,
                self.me,
                packet.source,
                AckPayload {
                    message_id: message.message_id,
                }
                .encode(),
            );
            self.retransmit(ack, Some(from), None);
        }
    }

    async fn on_fragment(&mut self, source: PeerId, body: Bytes, from: PeerId) {
        let assembled = match self.reassembler.add(source, body) {
            Ok(Some(assembled)) => assembled,
            Ok(None) => return,
            Err(err) => {
                debug!(from = %source, error = %err, "fragment rejected");
                return;
            }
        };
        let inner = match Packet::decode(assembled) {
            Ok(inner) => inner,
            Err(err) => {
                debug!(from = %source, error = %err, "reassembled packet undecodable");
                return;
            }
        };
        // The fragments themselves were already retransmitted hop by hop;
        // only the delivery half of the decision applies to the whole.
        match self.router.decide(&inner) {
            RouteAction::Deliver | RouteAction::DeliverAndForward { .. } => {
                Box::pin(self.deliver(inner, from)).await;
            }
            _ => {}
        }
    }

    fn replay_check(&mut self, source: PeerId, sealed: &[u8]) -> Result<(), NodeError> {
        let nonce = sealed_nonce(sealed)?;
        let timestamp = sealed_timestamp(sealed)?;
        self.replay.check(source, nonce, timestamp)?;
        Ok(())
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SendPrivate { to, content, reply } => {
                let _ = reply.send(self.send_private(to, content).await);
            }
            Command::SendChannel {
                channel,
                content,
                reply,
            } => {
                let _ = reply.send(self.send_channel(channel, content));
            }
            Command::JoinChannel {
                channel,
                password,
                reply,
            } => {
                let result = self
                    .channels
                    .join(&channel, &password)
                    .map_err(NodeError::from);
                let _ = reply.send(result);
            }
            Command::LeaveChannel { channel } => self.channels.leave(&channel),
            Command::Connect { peer, reply } => {
                self.links.dial(peer).await;
                let _ = reply.send(Ok(()));
            }
            Command::SetDutyCycle(fraction) => self.links.set_duty_cycle(fraction),
            Command::Suspend => {
                self.links.suspend().await;
                self.engine.suspend();
            }
            Command::Resume => {
                self.engine.resume();
                self.links.resume().await;
                self.announce();
            }
            Command::Wipe => {
                self.engine.wipe();
                self.channels.wipe();
                self.replay.clear();
                self.store.clear().await;
                info!("key material wiped");
            }
            Command::Shutdown => {}
        }
    }

    async fn send_private(&mut self, to: PeerId, content: String) -> Result<u64, NodeError> {
        if !self.engine.has_session(to) {
            let Some(info) = self.peers.get(to) else {
                return Err(NodeError::PeerUnknown(to));
            };
            let (exchange, signing) = (info.exchange_key, info.signing_key);
            self.engine.establish(to, &exchange, &signing)?;
        }

        let message_id = rand::random();
        let sealed = self.engine.seal_private(to, content.as_bytes())?;
        let payload = PrivatePayload {
            message_id,
            ciphertext: sealed.into(),
        }
        .encode();

        let mut packet = Packet::new(MessageType::Private, self.me, to, payload);
        packet.flags = PacketFlags::ENCRYPTED | PacketFlags::SIGNED | PacketFlags::ACK;

        let sent = self.transmit(packet, None)?;
        if sent == 0 {
            self.store
                .enqueue(to, Bytes::from(content.into_bytes()))
                .await?;
            self.emit(AppEvent::DeliveryPending { recipient: to });
        } else {
            self.remember_pending(message_id, to, content);
        }
        Ok(message_id)
    }

    fn send_channel(&mut self, channel: String, content: String) -> Result<u64, NodeError> {
        if !self.channels.is_member(&channel) {
            return Err(NodeError::NotJoined(channel));
        }
        let message_id = rand::random();
        let sealed = self
            .channels
            .seal(&channel, self.engine.identity(), content.as_bytes())?;
        let payload = ChannelPayload {
            message_id,
            channel,
            ciphertext: sealed.into(),
        }
        .encode()?;

        let mut packet = Packet::new(MessageType::Channel, self.me, PeerId::BROADCAST, payload);
        packet.flags = PacketFlags::ENCRYPTED | PacketFlags::SIGNED;
        self.transmit(packet, None)?;
        Ok(message_id)
    }

    /// Keep the plaintext of an unacked private message so an
    /// undeliverable frame can be parked instead of lost.
    fn remember_pending(&mut self, message_id: u64, to: PeerId, content: String) {
        self.pending_acks.insert(message_id, (to, content));
        self.pending_order.push_back(message_id);
        while self.pending_acks.len() > MAX_PENDING_ACKS {
            let Some(oldest) = self.pending_order.pop_front() else {
                break;
            };
            self.pending_acks.remove(&oldest);
        }
    }

    /// Fragment if needed and queue a locally originated (or revived)
    /// packet onto the mesh. Unicast prefers a learned next hop, falling
    /// back to a full flood.
    fn transmit(&mut self, packet: Packet, except: Option<PeerId>) -> Result<usize, NodeError> {
        let next_hop = if packet.dest.is_broadcast() {
            None
        } else {
            self.router.table().next_hop(packet.dest)
        };

        let mut sent = 0;
        for piece in self.fragmenter.split(&packet)? {
            let bytes = piece.encode()?;
            if let Some(hop) = next_hop {
                if self.links.send_to(hop, bytes.clone()).is_ok() {
                    sent += 1;
                    continue;
                }
            }
            sent += self.links.broadcast(bytes.clone(), except);
        }
        Ok(sent)
    }

    /// Queue an already TTL-decremented copy onward.
    fn retransmit(&mut self, packet: Packet, next_hop: Option<PeerId>, except: Option<PeerId>) {
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(error = %err, "unencodable packet not retransmitted");
                return;
            }
        };
        if let Some(hop) = next_hop {
            if self.links.send_to(hop, bytes.clone()).is_ok() {
                return;
            }
        }
        self.links.broadcast(bytes, except);
    }

    fn send_discovery_to(&mut self, peer: PeerId) {
        let announcement = DiscoveryPayload {
            nickname: self.config.nickname.clone(),
            signing_key: self.engine.identity().verifying_key(),
            // Per peer: each neighbor sees its own ephemeral exchange key.
            exchange_key: self.engine.exchange_key_for(peer),
        };
        let payload = match announcement.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "discovery announcement unencodable");
                return;
            }
        };
        let mut packet = Packet::new(MessageType::Discovery, self.me, PeerId::BROADCAST, payload);
        // Link-local: a zero hop budget keeps announcements off relays.
        packet.ttl = 0;
        if let Ok(bytes) = packet.encode() {
            if let Err(err) = self.links.send_to(peer, bytes) {
                debug!(peer = %peer, error = %err, "discovery send failed");
            }
        }
    }

    fn announce(&mut self) {
        for peer in self.links.connected_peers() {
            self.send_discovery_to(peer);
        }

        let advert = self.router.build_advert();
        if advert.entries.is_empty() {
            return;
        }
        let payload = match advert.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "routing advert unencodable");
                return;
            }
        };
        let mut packet = Packet::new(MessageType::Routing, self.me, PeerId::BROADCAST, payload);
        packet.ttl = 0;
        if let Ok(bytes) = packet.encode() {
            self.links.broadcast(bytes, None);
        }
    }

    fn send_pong(&mut self, peer: PeerId) {
        let mut pong = Packet::new(MessageType::Pong, self.me, peer, Bytes::new());
        pong.ttl = 0;
        if let Ok(bytes) = pong.encode() {
            let _ = self.links.send_to(peer, bytes);
        }
    }

    async fn maintain(&mut self) {
        let swept = self.reassembler.sweep(self.config.fragment_timeout);
        if swept > 0 {
            debug!(swept, "fragment buffers expired");
        }
        self.router.sweep();
        if let Err(err) = self.store.sweep_expired().await {
            warn!(error = %err, "store sweep failed");
        }
        self.links.sweep_idle(self.config.link_idle_timeout).await;
        for peer in self.peers.sweep_silent(self.config.peer_timeout) {
            self.peer_lost(peer);
        }
    }

    /// A peer stopped being reachable.
    ///
    /// Its session and our ephemeral for it are destroyed; the next
    /// contact derives fresh keys, so nothing recorded in the meantime
    /// can be unwrapped later. Replay state is kept in case the same
    /// traffic resurfaces.
    fn peer_lost(&mut self, peer: PeerId) {
        self.router.neighbor_lost(peer);
        if self.peers.mark_offline(peer) {
            self.engine.drop_session(peer);
            self.emit(AppEvent::PeerLost { peer });
        }
    }

    fn emit(&self, event: AppEvent) {
        // A stalled application loses events rather than stalling the mesh.
        if self.events_tx.try_send(event).is_err() {
            warn!("application event queue full, event dropped");
        }
    }
}
