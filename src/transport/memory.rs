//! In-process transport for tests and simulations
//!
//! A [`MemoryHub`] owns the topology: nodes register, links are created
//! explicitly, and frames flow only across existing links. This stands in
//! for the BLE adapter in multi-node tests where radio hardware is not
//! available, with the same trait surface and MTU behavior.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::PeerId;
use crate::transport::{Transport, TransportEvent, TransportStats, DEFAULT_LINK_MTU};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Shared topology for a set of in-process transports
pub struct MemoryHub {
    nodes: DashMap<PeerId, mpsc::Sender<TransportEvent>>,
    links: Mutex<HashSet<(PeerId, PeerId)>>,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            links: Mutex::new(HashSet::new()),
        })
    }

    /// Create a bidirectional link; both ends observe `Connected`
    pub fn link(&self, a: PeerId, b: PeerId) {
        if a == b {
            return;
        }
        self.links.lock().insert(link_key(a, b));
        self.notify(a, TransportEvent::Connected {
            peer_id: b,
            handle: format!("mem/{}", b),
        });
        self.notify(b, TransportEvent::Connected {
            peer_id: a,
            handle: format!("mem/{}", a),
        });
    }

    /// Drop a link; both ends observe `Disconnected`
    pub fn unlink(&self, a: PeerId, b: PeerId) {
        if self.links.lock().remove(&link_key(a, b)) {
            let reason = "link removed".to_string();
            self.notify(a, TransportEvent::Disconnected {
                peer_id: b,
                reason: reason.clone(),
            });
            self.notify(b, TransportEvent::Disconnected { peer_id: a, reason });
        }
    }

    pub fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        self.links.lock().contains(&link_key(a, b))
    }

    fn neighbors(&self, of: PeerId) -> Vec<PeerId> {
        self.links
            .lock()
            .iter()
            .filter_map(|(a, b)| {
                if *a == of {
                    Some(*b)
                } else if *b == of {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Remove a node and all of its links
    fn deregister(&self, peer_id: PeerId) {
        for neighbor in self.neighbors(peer_id) {
            self.unlink(peer_id, neighbor);
        }
        self.nodes.remove(&peer_id);
    }

    fn notify(&self, to: PeerId, event: TransportEvent) {
        if let Some(sender) = self.nodes.get(&to) {
            // Lossy by design: a saturated node sheds link events the same
            // way a saturated radio sheds frames
            let _ = sender.try_send(event);
        }
    }
}

/// One node's endpoint on a [`MemoryHub`]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local_peer_id: PeerId,
    mtu: usize,
    running: AtomicBool,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
    inbound_dropped: AtomicUsize,
}

impl MemoryTransport {
    pub fn register(hub: &Arc<MemoryHub>, local_peer_id: PeerId) -> Arc<Self> {
        Self::register_with_mtu(hub, local_peer_id, DEFAULT_LINK_MTU)
    }

    pub fn register_with_mtu(
        hub: &Arc<MemoryHub>,
        local_peer_id: PeerId,
        mtu: usize,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        hub.nodes.insert(local_peer_id, sender);

        Arc::new(Self {
            hub: hub.clone(),
            local_peer_id,
            mtu,
            running: AtomicBool::new(false),
            events: Mutex::new(Some(receiver)),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            inbound_dropped: AtomicUsize::new(0),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.hub.deregister(self.local_peer_id);
        Ok(())
    }

    async fn send(&self, peer_id: PeerId, frame: Vec<u8>) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::Transport("transport not started".to_string()));
        }
        if frame.len() > self.mtu {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Transport(format!(
                "frame of {} bytes exceeds link MTU {}",
                frame.len(),
                self.mtu
            )));
        }
        if !self.hub.is_linked(self.local_peer_id, peer_id) {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::NotConnected(peer_id.to_string()));
        }

        let sender = self
            .hub
            .nodes
            .get(&peer_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::NotConnected(peer_id.to_string()))?;

        let bytes = frame.len() as u64;
        match sender.try_send(TransportEvent::FrameReceived {
            peer_id: self.local_peer_id,
            frame,
        }) {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                // Receiver saturated or gone: shed the frame like a radio
                self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(Error::Backpressure(format!(
                    "peer {} inbound queue full",
                    peer_id
                )))
            }
        }
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }

    fn mtu(&self, _peer_id: &PeerId) -> usize {
        self.mtu
    }

    fn linked_peers(&self) -> Vec<PeerId> {
        self.hub.neighbors(self.local_peer_id)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: 0,
            send_failures: self.send_failures.load(Ordering::Relaxed),
            link_count: self.linked_peers().len(),
        }
    }
}
