//! Mesh routing over multi-node in-process topologies: broadcast
//! delivery, multi-hop relay with dedup, replay rejection.

mod common;

use std::time::Duration;

use bitchat::mesh::MeshEvent;
use bitchat::protocol::binary::BinaryProtocol;
use bitchat::protocol::tlv::MessagePayload;
use bitchat::protocol::{unix_time_ms, BitchatPacket, PacketType};
use bitchat::transport::MemoryHub;

use common::{expect_event, expect_no_event, is_message_with, spawn_node};

#[tokio::test]
async fn basic_broadcast_between_neighbors() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub).await;
    let mut bob = spawn_node(&hub).await;
    hub.link(alice.peer_id(), bob.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice
        .mesh
        .send_broadcast("hi", Some("alice".to_string()))
        .await
        .unwrap();

    let event = expect_event(&mut bob.events, Duration::from_secs(1), is_message_with("hi")).await;
    match event {
        MeshEvent::MessageReceived { from, nickname, .. } => {
            assert_eq!(from, alice.peer_id());
            assert_eq!(nickname.as_deref(), Some("alice"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn three_hop_relay_along_a_line() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub).await;
    let b = spawn_node(&hub).await;
    let c = spawn_node(&hub).await;
    let mut d = spawn_node(&hub).await;

    // Only adjacent pairs are in range: A - B - C - D
    hub.link(a.peer_id(), b.peer_id());
    hub.link(b.peer_id(), c.peer_id());
    hub.link(c.peer_id(), d.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;

    a.mesh
        .send_broadcast("chain", None)
        .await
        .unwrap();

    expect_event(&mut d.events, Duration::from_secs(2), is_message_with("chain")).await;

    // Each intermediate relayed exactly once; the edge node had nobody
    // left to forward to
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(b.mesh.stats().relayed, 1);
    assert_eq!(c.mesh.stats().relayed, 1);
    assert_eq!(d.mesh.stats().relayed, 0);
}

#[tokio::test]
async fn duplicate_frames_deliver_once() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub).await;
    let mut bob = spawn_node(&hub).await;
    hub.link(alice.peer_id(), bob.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let payload = MessagePayload::new("once").encode().unwrap();
    let mut packet =
        BitchatPacket::new_broadcast(PacketType::Message, alice.peer_id(), payload);
    alice.identity.sign_packet(&mut packet);
    let frame = BinaryProtocol::encode(&packet);

    bob.mesh.handle_frame(alice.peer_id(), &frame).await;
    bob.mesh.handle_frame(alice.peer_id(), &frame).await;

    expect_event(&mut bob.events, Duration::from_secs(1), is_message_with("once")).await;
    expect_no_event(&mut bob.events, Duration::from_millis(300), is_message_with("once")).await;
    assert_eq!(bob.mesh.stats().duplicates_dropped, 1);
}

#[tokio::test]
async fn stale_timestamp_is_dropped_before_delivery() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub).await;
    let mut bob = spawn_node(&hub).await;
    hub.link(alice.peer_id(), bob.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A replayed capture: valid signature, 35 seconds old
    let payload = MessagePayload::new("replayed").encode().unwrap();
    let mut packet =
        BitchatPacket::new_broadcast(PacketType::Message, alice.peer_id(), payload);
    packet.timestamp_ms = unix_time_ms() - 35_000;
    alice.identity.sign_packet(&mut packet);
    let frame = BinaryProtocol::encode(&packet);

    bob.mesh.handle_frame(alice.peer_id(), &frame).await;

    expect_no_event(
        &mut bob.events,
        Duration::from_millis(300),
        is_message_with("replayed"),
    )
    .await;
    assert_eq!(bob.mesh.stats().replay_dropped, 1);
}

#[tokio::test]
async fn ttl_zero_is_never_relayed() {
    let hub = MemoryHub::new();
    let a = spawn_node(&hub).await;
    let b = spawn_node(&hub).await;
    let mut c = spawn_node(&hub).await;
    hub.link(a.peer_id(), b.peer_id());
    hub.link(b.peer_id(), c.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // TTL 1: B may deliver it, but the decrement leaves nothing to relay
    let payload = MessagePayload::new("one hop only").encode().unwrap();
    let mut packet = BitchatPacket::new_broadcast(PacketType::Message, a.peer_id(), payload);
    packet.ttl = 1;
    a.identity.sign_packet(&mut packet);
    let frame = BinaryProtocol::encode(&packet);

    b.mesh.handle_frame(a.peer_id(), &frame).await;

    expect_no_event(
        &mut c.events,
        Duration::from_millis(400),
        is_message_with("one hop only"),
    )
    .await;
    assert_eq!(b.mesh.stats().relayed, 0);
}

#[tokio::test]
async fn leave_packet_evicts_peer() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub).await;
    let mut bob = spawn_node(&hub).await;
    hub.link(alice.peer_id(), bob.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice.mesh.leave().await.unwrap();

    let event = expect_event(&mut bob.events, Duration::from_secs(1), |event| {
        matches!(event, MeshEvent::PeerLost { .. })
    })
    .await;
    match event {
        MeshEvent::PeerLost { peer_id } => assert_eq!(peer_id, alice.peer_id()),
        other => panic!("unexpected event: {:?}", other),
    }
}
