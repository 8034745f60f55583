//! End-to-end scenarios wiring multiple in-process `Runtime`s together over
//! the in-memory `LoopbackLink` transport, exercising the seven invariants
//! and the six named scenarios from spec.md §8.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use meshcore::api::{Api, Topic};
use meshcore::config::Config;
use meshcore::crypto::HandshakeStatus;
use meshcore::runtime::Runtime;
use meshcore::transport::LoopbackNetwork;
use meshcore::{Identity, NodeId};

fn test_config(passphrase: &str) -> Config {
    Config {
        group_passphrase: passphrase.into(),
        max_ttl: 6,
        scan_interval_sec: 10,
        packet_size_limit: 1 << 20,
        seen_lru_limit: 4096,
        max_connections: 8,
        max_inline_file_bytes: 2_000_000,
        inbound_queue_capacity: 1024,
        presence_interval_sec: 3600,
        data_dir: std::env::temp_dir().join(format!("meshcore-scenarios-{}", uuid::Uuid::new_v4())),
    }
}

async fn spawn(net: &Arc<LoopbackNetwork>, passphrase: &str) -> Api {
    let identity = Identity::generate();
    let overflow = Arc::new(AtomicU64::new(0));
    let link = Arc::new(net.join(identity.node_id, 1024, overflow.clone()));
    let runtime = Runtime::start_with_link(test_config(passphrase), identity, link, overflow).await.unwrap();
    Api::new(Arc::new(runtime))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

/// S1 — three-node broadcast over a line topology (A-B-C, A and C not
/// directly linked): A's text reaches both B and C exactly once.
#[tokio::test]
async fn s1_three_node_broadcast_over_a_line() {
    let net = LoopbackNetwork::new();
    let a = spawn(&net, "hello").await;
    let b = spawn(&net, "hello").await;
    let c = spawn(&net, "hello").await;

    a.connect(b.node_id()).await.unwrap();
    b.connect(a.node_id()).await.unwrap();
    b.connect(c.node_id()).await.unwrap();
    c.connect(b.node_id()).await.unwrap();
    settle().await;

    let mut b_rx = match b.subscribe(Topic::Message).await {
        meshcore::api::Subscription::Message(rx) => rx,
        _ => unreachable!(),
    };
    let mut c_rx = match c.subscribe(Topic::Message).await {
        meshcore::api::Subscription::Message(rx) => rx,
        _ => unreachable!(),
    };

    a.send_text(NodeId::BROADCAST, b"hi").await.unwrap();

    let from_b = tokio::time::timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap().unwrap();
    assert_eq!(from_b.body, b"hi");
    let from_c = tokio::time::timeout(Duration::from_secs(1), c_rx.recv()).await.unwrap().unwrap();
    assert_eq!(from_c.body, b"hi");

    settle().await;
    assert!(tokio::time::timeout(Duration::from_millis(100), c_rx.recv()).await.is_err());
}

/// S2 — ring A-B-C-A: a single broadcast envelope is relayed at most twice
/// per link and each of B, C delivers exactly once (no flood storm).
#[tokio::test]
async fn s2_loop_suppression_on_a_ring() {
    let net = LoopbackNetwork::new();
    let a = spawn(&net, "ring").await;
    let b = spawn(&net, "ring").await;
    let c = spawn(&net, "ring").await;

    a.connect(b.node_id()).await.unwrap();
    b.connect(a.node_id()).await.unwrap();
    b.connect(c.node_id()).await.unwrap();
    c.connect(b.node_id()).await.unwrap();
    c.connect(a.node_id()).await.unwrap();
    a.connect(c.node_id()).await.unwrap();
    settle().await;

    let mut b_rx = match b.subscribe(Topic::Message).await {
        meshcore::api::Subscription::Message(rx) => rx,
        _ => unreachable!(),
    };
    let mut c_rx = match c.subscribe(Topic::Message).await {
        meshcore::api::Subscription::Message(rx) => rx,
        _ => unreachable!(),
    };

    a.send_text(NodeId::BROADCAST, b"ring").await.unwrap();

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap().unwrap().body,
        b"ring"
    );
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), c_rx.recv()).await.unwrap().unwrap().body,
        b"ring"
    );
    settle().await;
    assert!(tokio::time::timeout(Duration::from_millis(100), b_rx.recv()).await.is_err());
    assert!(tokio::time::timeout(Duration::from_millis(100), c_rx.recv()).await.is_err());
}

/// S3 is covered directly in `src/mesh.rs` (pairwise `send_text` on a
/// session-less peer triggers the handshake and flushes once established).

/// S4 — offline outbox: B disconnects after the handshake is established,
/// A sends three pairwise messages, B reconnects and receives all three in
/// order exactly once.
#[tokio::test]
async fn s4_offline_outbox_delivers_in_order_on_reconnect() {
    let net = LoopbackNetwork::new();
    let a = spawn(&net, "offline").await;
    let b = spawn(&net, "offline").await;

    a.connect(b.node_id()).await.unwrap();
    b.connect(a.node_id()).await.unwrap();
    settle().await;

    let mut handshake_rx = match a.subscribe(Topic::Handshake).await {
        meshcore::api::Subscription::Handshake(rx) => rx,
        _ => unreachable!(),
    };
    a.send_text(b.node_id(), b"wake up").await.unwrap();
    loop {
        let evt = tokio::time::timeout(Duration::from_secs(1), handshake_rx.recv()).await.unwrap().unwrap();
        if matches!(evt.status, HandshakeStatus::Established) {
            break;
        }
    }

    let mut b_rx = match b.subscribe(Topic::Message).await {
        meshcore::api::Subscription::Message(rx) => rx,
        _ => unreachable!(),
    };
    let first = tokio::time::timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.body, b"wake up");

    b.disconnect(a.node_id()).await.unwrap();
    settle().await;

    a.send_text(b.node_id(), b"one").await.unwrap();
    a.send_text(b.node_id(), b"two").await.unwrap();
    a.send_text(b.node_id(), b"three").await.unwrap();
    settle().await;

    assert!(tokio::time::timeout(Duration::from_millis(50), b_rx.recv()).await.is_err());

    a.connect(b.node_id()).await.unwrap();
    b.connect(a.node_id()).await.unwrap();

    let second = tokio::time::timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap().unwrap();
    let third = tokio::time::timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap().unwrap();
    let fourth = tokio::time::timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.body, b"one");
    assert_eq!(third.body, b"two");
    assert_eq!(fourth.body, b"three");
}

/// S5 — wrong-passphrase peers never decrypt each other's broadcast
/// envelopes; the tampered packet is still recorded as seen, so it is not
/// re-flooded indefinitely.
#[tokio::test]
async fn s5_wrong_passphrase_never_decrypts() {
    let net = LoopbackNetwork::new();
    let a = spawn(&net, "correct horse").await;
    let b = spawn(&net, "a different passphrase").await;

    a.connect(b.node_id()).await.unwrap();
    b.connect(a.node_id()).await.unwrap();
    settle().await;

    let mut b_rx = match b.subscribe(Topic::Message).await {
        meshcore::api::Subscription::Message(rx) => rx,
        _ => unreachable!(),
    };
    a.send_text(NodeId::BROADCAST, b"secret").await.unwrap();

    assert!(tokio::time::timeout(Duration::from_millis(200), b_rx.recv()).await.is_err());
    assert_eq!(b.metrics().decrypt_failures, 1);
}

/// S6 — a file larger than one chunk arrives as one reassembled event with
/// byte-identical content.
#[tokio::test]
async fn s6_chunked_file_reassembles_byte_identical() {
    let net = LoopbackNetwork::new();
    let a = spawn(&net, "files").await;
    let b = spawn(&net, "files").await;

    a.connect(b.node_id()).await.unwrap();
    b.connect(a.node_id()).await.unwrap();
    settle().await;

    let mut b_rx = match b.subscribe(Topic::Message).await {
        meshcore::api::Subscription::Message(rx) => rx,
        _ => unreachable!(),
    };

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    a.send_file(NodeId::BROADCAST, &payload, "application/octet-stream").await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), b_rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.body, payload);
}
