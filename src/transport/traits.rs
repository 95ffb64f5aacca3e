//! Transport trait definition
//!
//! Kept deliberately small: a transport moves frames to linked peers,
//! reports link events, and knows each link's MTU. Everything else (mesh
//! routing, sessions, fragmentation) lives above this seam, so bridge
//! transports can plug in behind it.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::PeerId;
use crate::transport::{TransportEvent, TransportStats};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring the transport up (advertising, scanning, listeners)
    async fn start(&self) -> Result<()>;

    /// Tear the transport down; links drop and events stop
    async fn stop(&self) -> Result<()>;

    /// Send one frame to a directly linked peer. The frame must fit the
    /// link MTU; callers fragment first.
    async fn send(&self, peer_id: PeerId, frame: Vec<u8>) -> Result<()>;

    /// Hand out the event stream. Single consumer; returns `None` after
    /// the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Negotiated MTU towards a peer (a conservative default when unknown)
    fn mtu(&self, peer_id: &PeerId) -> usize;

    /// Peers with a live link right now
    fn linked_peers(&self) -> Vec<PeerId>;

    /// Whether a live link to this peer exists
    fn is_linked(&self, peer_id: &PeerId) -> bool {
        self.linked_peers().contains(peer_id)
    }

    /// Transport counters
    fn stats(&self) -> TransportStats;
}
