//! Mesh chat node binary.
//!
//! Binds the TCP transport, restores (or mints) the node identity, dials
//! any statically configured peers, joins the configured channels, and
//! runs the node until Ctrl-C.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use whisper_crypto::Identity;
use whisper_link::TcpTransport;
use whisper_node::{AppEvent, MeshNode, MessageContext, NodeConfig, NodeHandle};
use whisper_store::MemoryStore;
use whisper_wire::PeerId;

mod config;
mod logging;

use config::{NodeSettings, StaticPeer};
use logging::WhisperLogFormatter;

/// Decentralized mesh chat node
#[derive(Parser, Debug)]
#[command(name = "whisper-mesh", version, about = "Decentralized mesh chat node")]
struct Args {
    /// Path to the YAML config file
    #[arg(long, default_value = "./whisper.yaml")]
    config: PathBuf,

    /// Nickname announced to peers (overrides config)
    #[arg(long)]
    nickname: Option<String>,

    /// Listen address, e.g. 0.0.0.0:4400 (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Static peer as id@addr, e.g. aabbccdd@10.0.0.2:4400 (repeatable)
    #[arg(long)]
    peer: Vec<String>,

    /// Discovery and routing announcement interval, e.g. 30s
    #[arg(long, default_value = "30s")]
    advert_interval: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level)
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("default filter is valid");
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(WhisperLogFormatter::new())
        .init();

    let mut settings = NodeSettings::load_from_file(&args.config)?;
    if let Some(nickname) = args.nickname {
        settings.nickname = nickname;
    }
    if let Some(listen) = args.listen {
        settings.listen = listen;
    }
    for spec in &args.peer {
        settings.peers.push(parse_peer_spec(spec)?);
    }

    let identity = load_identity(&settings.identity_file)?;
    let me = identity.peer_id();
    info!(peer = %me, nickname = %settings.nickname, "identity ready");

    let (transport, transport_rx) = TcpTransport::bind(me, &settings.listen).await?;
    for peer in &settings.peers {
        transport.add_peer(PeerId(peer.id_bytes()?), peer.addr.clone());
    }

    let node_config = NodeConfig {
        nickname: settings.nickname.clone(),
        max_links: settings.max_links,
        advert_interval: args.advert_interval.into(),
        ..NodeConfig::default()
    };
    let (node, handle, events) = MeshNode::new(
        identity,
        Arc::new(transport),
        transport_rx,
        Arc::new(MemoryStore::new()),
        node_config,
    );
    let node_task = tokio::spawn(node.run());
    tokio::spawn(print_events(events));

    handle.set_duty_cycle(settings.duty_cycle).await?;
    for channel in &settings.channels {
        handle
            .join_channel(channel.name.clone(), channel.password.clone())
            .await?;
        info!(channel = %channel.name, "joined channel");
    }
    dial_static_peers(&handle, &settings.peers).await;

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    handle.shutdown().await.ok();
    node_task.await.ok();
    Ok(())
}

/// Parse `id@addr` into a static peer entry.
fn parse_peer_spec(spec: &str) -> Result<StaticPeer> {
    let (id, addr) = spec
        .split_once('@')
        .ok_or_else(|| anyhow!("peer spec {spec:?} must be id@addr"))?;
    Ok(StaticPeer {
        id: id.to_string(),
        addr: addr.to_string(),
    })
}

/// Restore the identity from disk, minting and saving one on first run.
///
/// Only the Ed25519 signing seed is persisted; exchange keys are
/// ephemeral and never touch disk.
fn load_identity(path: &str) -> Result<Identity> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let raw = hex::decode(content.trim())
                .with_context(|| format!("identity file {path:?} is not hex"))?;
            let seed: [u8; 32] = raw
                .try_into()
                .map_err(|_| anyhow!("identity file {path:?} must hold 32 bytes"))?;
            Ok(Identity::from_seed(seed))
        }
        Err(_) => {
            let mut seed = [0u8; 32];
            OsRng.fill_bytes(&mut seed);
            std::fs::write(path, hex::encode(seed))
                .with_context(|| format!("writing identity file {path:?}"))?;
            info!(%path, "minted new identity");
            Ok(Identity::from_seed(seed))
        }
    }
}

async fn dial_static_peers(handle: &NodeHandle, peers: &[StaticPeer]) {
    for peer in peers {
        let Ok(id) = peer.id_bytes() else { continue };
        match handle.connect(PeerId(id)).await {
            Ok(()) => info!(peer = %peer.id, addr = %peer.addr, "dialing static peer"),
            Err(err) => warn!(peer = %peer.id, addr = %peer.addr, error = %err, "static peer dial not started"),
        }
    }
}

async fn print_events(mut events: tokio::sync::mpsc::Receiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::MessageReceived {
                sender,
                nickname,
                context,
                content,
            } => {
                let who = nickname.unwrap_or_else(|| sender.to_string());
                match context {
                    MessageContext::Channel(channel) => {
                        info!("[#{channel}] <{who}> {content}");
                    }
                    MessageContext::Private => info!("[dm] <{who}> {content}"),
                }
            }
            AppEvent::PeerSeen { peer, nickname } => {
                info!(peer = %peer, nickname = %nickname, "peer online");
            }
            AppEvent::PeerLost { peer } => info!(peer = %peer, "peer offline"),
            AppEvent::DeliveryPending { recipient } => {
                info!(recipient = %recipient, "message parked for offline peer");
            }
            AppEvent::Acked { message_id } => {
                info!(message_id, "message acknowledged");
            }
        }
    }
}
