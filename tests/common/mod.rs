//! Shared fixtures for the integration suites: in-process nodes wired
//! over a memory hub with an explicit link topology.
#![allow(dead_code)] // each suite uses its own subset

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use bitchat::crypto::BitchatIdentity;
use bitchat::mesh::{MeshConfig, MeshEvent, MeshService};
use bitchat::protocol::PeerId;
use bitchat::transport::{MemoryHub, MemoryTransport};

pub struct TestNode {
    pub identity: Arc<BitchatIdentity>,
    pub mesh: Arc<MeshService>,
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
    pub transport: Arc<MemoryTransport>,
}

impl TestNode {
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }
}

/// Spin up a node on the hub (not yet linked to anyone)
pub async fn spawn_node(hub: &Arc<MemoryHub>) -> TestNode {
    spawn_node_with_mtu(hub, bitchat::transport::DEFAULT_LINK_MTU).await
}

pub async fn spawn_node_with_mtu(
    hub: &Arc<MemoryHub>,
    mtu: usize,
) -> TestNode {
    let identity = Arc::new(BitchatIdentity::generate());
    let transport = MemoryTransport::register_with_mtu(hub, identity.peer_id(), mtu);
    let (mesh, events) = MeshService::new(
        identity.clone(),
        transport.clone(),
        MeshConfig::default(),
    );
    mesh.start().await.expect("mesh start");

    TestNode {
        identity,
        mesh,
        events,
        transport,
    }
}

/// Wait until an event matching the predicate arrives, or panic after the
/// deadline
pub async fn expect_event<F>(
    events: &mut mpsc::UnboundedReceiver<MeshEvent>,
    deadline: Duration,
    mut predicate: F,
) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    let wait = tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    });
    wait.await.expect("timed out waiting for event")
}

/// Assert that no event matching the predicate arrives within the window
pub async fn expect_no_event<F>(
    events: &mut mpsc::UnboundedReceiver<MeshEvent>,
    window: Duration,
    mut predicate: F,
) where
    F: FnMut(&MeshEvent) -> bool,
{
    let result = tokio::time::timeout(window, async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => {
                    std::future::pending::<MeshEvent>().await;
                }
            }
        }
    })
    .await;
    assert!(result.is_err(), "unexpected event: {:?}", result.unwrap());
}

pub fn is_message_with(content: &str) -> impl FnMut(&MeshEvent) -> bool + '_ {
    move |event| {
        matches!(event, MeshEvent::MessageReceived { content: c, .. } if c == content)
    }
}

/// Printable text with enough churn that LZ4 cannot shrink it, so
/// payload sizes survive the codec's compression pass
pub fn incompressible_text(len: usize) -> String {
    let mut state = 0x9E3779B97F4A7C15u64;
    let mut out = String::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.push((b'!' + (state % 94) as u8) as char);
    }
    out
}
