//! End-to-end tests over an in-process hub.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use whisper_crypto::Identity;
use whisper_link::MemoryHub;
use whisper_node::{AppEvent, MeshNode, MessageContext, NodeConfig, NodeHandle};
use whisper_store::MemoryStore;
use whisper_wire::PeerId;

const WAIT: Duration = Duration::from_secs(30);

fn spawn_node(hub: &MemoryHub, nickname: &str) -> (PeerId, NodeHandle, mpsc::Receiver<AppEvent>) {
    let identity = Identity::generate();
    let id = identity.peer_id();
    let (transport, transport_rx) = hub.attach(id);
    let config = NodeConfig {
        nickname: nickname.into(),
        advert_interval: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(200),
        ..NodeConfig::default()
    };
    let (node, handle, events) = MeshNode::new(
        identity,
        Arc::new(transport),
        transport_rx,
        Arc::new(MemoryStore::new()),
        config,
    );
    tokio::spawn(node.run());
    (id, handle, events)
}

async fn wait_for<F>(events: &mut mpsc::Receiver<AppEvent>, mut pred: F) -> AppEvent
where
    F: FnMut(&AppEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_peer_seen(events: &mut mpsc::Receiver<AppEvent>, peer: PeerId) {
    wait_for(events, |event| {
        matches!(event, AppEvent::PeerSeen { peer: seen, .. } if *seen == peer)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channel_message_relays_once_over_redundant_paths() {
    let hub = MemoryHub::new();
    let (a_id, a, mut a_events) = spawn_node(&hub, "anna");
    let (b_id, _b, mut b_events) = spawn_node(&hub, "bruno");
    let (c_id, c, mut c_events) = spawn_node(&hub, "cleo");
    let (d_id, _d, mut d_events) = spawn_node(&hub, "dora");

    // Diamond topology: A reaches C only through B or D, so C gets a
    // copy of every flood down both paths.
    hub.wire(a_id, b_id);
    hub.wire(a_id, d_id);
    hub.wire(b_id, c_id);
    hub.wire(d_id, c_id);

    wait_peer_seen(&mut a_events, b_id).await;
    wait_peer_seen(&mut a_events, d_id).await;
    wait_peer_seen(&mut c_events, b_id).await;
    wait_peer_seen(&mut c_events, d_id).await;
    wait_peer_seen(&mut d_events, a_id).await;

    // A and C share the channel secret; the relay B does not.
    a.join_channel("general".into(), "hunter2".into())
        .await
        .unwrap();
    c.join_channel("general".into(), "hunter2".into())
        .await
        .unwrap();

    // 1200 bytes of plaintext forces fragmentation on the 512-byte MTU.
    let content = "m".repeat(1200);
    a.send_channel("general".into(), content.clone())
        .await
        .unwrap();

    let received = wait_for(&mut c_events, |event| {
        matches!(event, AppEvent::MessageReceived { .. })
    })
    .await;
    match received {
        AppEvent::MessageReceived {
            sender,
            nickname,
            context,
            content: body,
        } => {
            assert_eq!(sender, a_id);
            // Discovery is link-local, so C never learned A's nickname.
            assert_eq!(nickname, None);
            assert_eq!(context, MessageContext::Channel("general".into()));
            assert_eq!(body, content);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Exactly once: the copy arriving over the second path is dropped
    // as a duplicate.
    let duplicate = timeout(Duration::from_millis(500), async {
        loop {
            if let Some(AppEvent::MessageReceived { .. }) = c_events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(duplicate.is_err(), "channel message delivered twice");

    // The relay forwarded bytes it could not read.
    let leaked = timeout(Duration::from_millis(200), async {
        loop {
            if let Some(AppEvent::MessageReceived { .. }) = b_events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(leaked.is_err(), "relay decrypted a channel it never joined");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn private_message_roundtrip_with_ack() {
    let hub = MemoryHub::new();
    let (a_id, a, mut a_events) = spawn_node(&hub, "anna");
    let (b_id, _b, mut b_events) = spawn_node(&hub, "bruno");
    hub.wire(a_id, b_id);

    wait_peer_seen(&mut a_events, b_id).await;
    wait_peer_seen(&mut b_events, a_id).await;

    let message_id = a.send_private(b_id, "meet at dawn".into()).await.unwrap();

    let received = wait_for(&mut b_events, |event| {
        matches!(event, AppEvent::MessageReceived { .. })
    })
    .await;
    match received {
        AppEvent::MessageReceived {
            sender,
            context,
            content,
            ..
        } => {
            assert_eq!(sender, a_id);
            assert_eq!(context, MessageContext::Private);
            assert_eq!(content, "meet at dawn");
        }
        other => panic!("unexpected event {other:?}"),
    }

    wait_for(&mut a_events, |event| {
        matches!(event, AppEvent::Acked { message_id: acked } if *acked == message_id)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn private_message_to_unknown_peer_fails() {
    let hub = MemoryHub::new();
    let (_a_id, a, _a_events) = spawn_node(&hub, "anna");
    let stranger = PeerId::from_bytes([9, 9, 9, 9]);
    let result = a.send_private(stranger, "anyone there".into()).await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn offline_message_delivered_on_reappearance() {
    let hub = MemoryHub::new();
    let (a_id, a, mut a_events) = spawn_node(&hub, "anna");
    let (b_id, _b, mut b_events) = spawn_node(&hub, "bruno");
    hub.wire(a_id, b_id);

    wait_peer_seen(&mut a_events, b_id).await;
    wait_peer_seen(&mut b_events, a_id).await;

    // B drops off the mesh.
    hub.unwire(a_id, b_id);
    wait_for(&mut a_events, |event| {
        matches!(event, AppEvent::PeerLost { peer } if *peer == b_id)
    })
    .await;

    // The send cannot reach anyone and gets parked.
    a.send_private(b_id, "read this later".into()).await.unwrap();
    wait_for(&mut a_events, |event| {
        matches!(event, AppEvent::DeliveryPending { recipient } if *recipient == b_id)
    })
    .await;

    // B comes back; the parked message flows on its next announcement.
    hub.wire(a_id, b_id);
    let received = wait_for(&mut b_events, |event| {
        matches!(event, AppEvent::MessageReceived { .. })
    })
    .await;
    match received {
        AppEvent::MessageReceived { sender, content, .. } => {
            assert_eq!(sender, a_id);
            assert_eq!(content, "read this later");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_channel_password_reads_nothing() {
    let hub = MemoryHub::new();
    let (a_id, a, mut a_events) = spawn_node(&hub, "anna");
    let (b_id, b, mut b_events) = spawn_node(&hub, "bruno");
    hub.wire(a_id, b_id);

    wait_peer_seen(&mut a_events, b_id).await;
    wait_peer_seen(&mut b_events, a_id).await;

    a.join_channel("ops".into(), "correct horse".into())
        .await
        .unwrap();
    b.join_channel("ops".into(), "wrong battery".into())
        .await
        .unwrap();

    a.send_channel("ops".into(), "staple".into()).await.unwrap();

    let received = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(AppEvent::MessageReceived { .. }) = b_events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(received.is_err(), "message decrypted under the wrong password");
}
