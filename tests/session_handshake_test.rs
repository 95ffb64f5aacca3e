//! End-to-end Noise sessions over the mesh: lazy handshakes on first
//! direct send, concurrent-initiation convergence, acknowledgment flow,
//! store-and-forward for offline recipients.

mod common;

use std::time::Duration;

use bitchat::mesh::MeshEvent;
use bitchat::transport::MemoryHub;

use common::{expect_event, is_message_with, spawn_node, TestNode};

/// Announce both ways so each side knows the other's identity keys
async fn introduce(a: &TestNode, b: &TestNode) {
    a.mesh.announce("a").await.unwrap();
    b.mesh.announce("b").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn direct_message_establishes_session_and_acks() {
    let hub = MemoryHub::new();
    let mut alice = spawn_node(&hub).await;
    let mut bob = spawn_node(&hub).await;
    hub.link(alice.peer_id(), bob.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;
    introduce(&alice, &bob).await;

    let message_id = alice
        .mesh
        .send_direct(bob.peer_id(), "secret", Some("alice".to_string()))
        .await
        .unwrap();

    // The handshake runs lazily, then the queued plaintext flows
    expect_event(&mut bob.events, Duration::from_secs(2), is_message_with("secret")).await;

    // Both sides authenticated each other
    let bob_id = bob.peer_id();
    expect_event(&mut alice.events, Duration::from_secs(2), move |event| {
        matches!(event, MeshEvent::PeerAuthenticated { peer_id, .. } if *peer_id == bob_id)
    })
    .await;
    assert!(alice.mesh.sessions().is_established(bob.peer_id()));
    assert!(bob.mesh.sessions().is_established(alice.peer_id()));

    // The recipient acknowledged the inner message id
    let ack = expect_event(&mut alice.events, Duration::from_secs(2), |event| {
        matches!(event, MeshEvent::DeliveryAck { .. })
    })
    .await;
    match ack {
        MeshEvent::DeliveryAck { message_id: acked, peer_id } => {
            assert_eq!(acked, message_id);
            assert_eq!(peer_id, bob.peer_id());
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // Fingerprints bind to the wire ids on both ends
    let fingerprint = alice
        .mesh
        .sessions()
        .fingerprint_of(bob.peer_id())
        .expect("authenticated static");
    assert_eq!(fingerprint.peer_id(), bob.peer_id());
}

#[tokio::test]
async fn concurrent_initiation_converges() {
    let hub = MemoryHub::new();
    let mut alice = spawn_node(&hub).await;
    let mut bob = spawn_node(&hub).await;
    hub.link(alice.peer_id(), bob.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;
    introduce(&alice, &bob).await;

    // Both sides fire a direct send at the same time
    let (to_bob, to_alice) = tokio::join!(
        alice.mesh.send_direct(bob.peer_id(), "x from a", None),
        bob.mesh.send_direct(alice.peer_id(), "x from b", None),
    );
    to_bob.unwrap();
    to_alice.unwrap();

    // The tie-break converges on a single handshake; both plaintexts land
    expect_event(&mut bob.events, Duration::from_secs(3), is_message_with("x from a")).await;
    expect_event(&mut alice.events, Duration::from_secs(3), is_message_with("x from b")).await;

    assert!(alice.mesh.sessions().is_established(bob.peer_id()));
    assert!(bob.mesh.sessions().is_established(alice.peer_id()));
}

#[tokio::test]
async fn established_sessions_carry_both_directions() {
    let hub = MemoryHub::new();
    let mut alice = spawn_node(&hub).await;
    let mut bob = spawn_node(&hub).await;
    hub.link(alice.peer_id(), bob.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;
    introduce(&alice, &bob).await;

    alice
        .mesh
        .send_direct(bob.peer_id(), "first", None)
        .await
        .unwrap();
    expect_event(&mut bob.events, Duration::from_secs(2), is_message_with("first")).await;

    // Session now exists; the reply uses it without another handshake
    let started_before = bob.mesh.sessions().stats().handshakes_started;
    bob.mesh
        .send_direct(alice.peer_id(), "reply", None)
        .await
        .unwrap();
    expect_event(&mut alice.events, Duration::from_secs(2), is_message_with("reply")).await;
    assert_eq!(bob.mesh.sessions().stats().handshakes_started, started_before);
}

#[tokio::test]
async fn offline_recipient_gets_queued_messages_on_return() {
    let hub = MemoryHub::new();
    let mut alice = spawn_node(&hub).await;
    let mut bob = spawn_node(&hub).await;
    hub.link(alice.peer_id(), bob.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;
    introduce(&alice, &bob).await;

    // Establish the session first
    alice
        .mesh
        .send_direct(bob.peer_id(), "warmup", None)
        .await
        .unwrap();
    expect_event(&mut bob.events, Duration::from_secs(2), is_message_with("warmup")).await;

    // Bob drops off the mesh
    hub.unlink(alice.peer_id(), bob.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice
        .mesh
        .send_direct(bob.peer_id(), "while you were out", None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Bob reconnects; the queue drains over the live session
    hub.link(alice.peer_id(), bob.peer_id());
    expect_event(
        &mut bob.events,
        Duration::from_secs(2),
        is_message_with("while you were out"),
    )
    .await;
}

#[tokio::test]
async fn direct_send_to_unknown_peer_is_rejected() {
    let hub = MemoryHub::new();
    let alice = spawn_node(&hub).await;

    let stranger = bitchat::protocol::PeerId::from_bytes([0x42; 8]);
    assert!(alice
        .mesh
        .send_direct(stranger, "hello?", None)
        .await
        .is_err());
}
