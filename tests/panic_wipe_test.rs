//! Emergency wipe: sessions zeroized, state cleared, radio silent.

mod common;

use std::time::Duration;

use bitchat::transport::{MemoryHub, Transport};

use common::{expect_event, expect_no_event, is_message_with, spawn_node};

#[tokio::test]
async fn panic_wipes_sessions_state_and_transport() {
    let hub = MemoryHub::new();
    let mut alice = spawn_node(&hub).await;
    let mut bob = spawn_node(&hub).await;
    let mut carol = spawn_node(&hub).await;
    hub.link(alice.peer_id(), bob.peer_id());
    hub.link(alice.peer_id(), carol.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice.mesh.announce("alice").await.unwrap();
    bob.mesh.announce("bob").await.unwrap();
    carol.mesh.announce("carol").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Established sessions with both peers
    alice
        .mesh
        .send_direct(bob.peer_id(), "to bob", None)
        .await
        .unwrap();
    alice
        .mesh
        .send_direct(carol.peer_id(), "to carol", None)
        .await
        .unwrap();
    expect_event(&mut bob.events, Duration::from_secs(2), is_message_with("to bob")).await;
    expect_event(&mut carol.events, Duration::from_secs(2), is_message_with("to carol")).await;
    assert!(alice.mesh.sessions().is_established(bob.peer_id()));
    assert!(alice.mesh.sessions().is_established(carol.peer_id()));

    // A non-empty offline queue: bob walks away mid-conversation
    hub.unlink(alice.peer_id(), bob.peer_id());
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice
        .mesh
        .send_direct(bob.peer_id(), "queued", None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice.mesh.panic_wipe().await;

    // Key material gone, peers forgotten
    assert!(!alice.mesh.sessions().is_established(bob.peer_id()));
    assert!(!alice.mesh.sessions().is_established(carol.peer_id()));
    assert!(alice.mesh.sessions().established_peers().is_empty());
    assert!(alice.mesh.connected_peers().is_empty());

    // The radio is silent: outbound sends fail at the transport
    assert!(alice
        .transport
        .send(carol.peer_id(), vec![0u8; 8])
        .await
        .is_err());

    // Inbound ciphertexts from a surviving session no longer decrypt into
    // events; carol still has her (now orphaned) session with alice
    carol
        .mesh
        .send_direct(alice.peer_id(), "are you there?", None)
        .await
        .unwrap();
    expect_no_event(
        &mut alice.events,
        Duration::from_millis(400),
        is_message_with("are you there?"),
    )
    .await;
}
