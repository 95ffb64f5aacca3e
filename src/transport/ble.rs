//! Bluetooth LE mesh transport
//!
//! Central role is concrete (btleplug): duty-cycled scans filtered on the
//! mesh service UUID, connect, subscribe to the notify characteristic,
//! write frames to the writable characteristic under credit-based flow
//! control. The peripheral role (advertising + GATT server) differs per
//! platform and plugs in behind [`BleAdvertiser`].
//!
//! Links are keyed by wire peer id. A freshly connected peripheral is
//! anonymous until its first frame arrives; the sender id sits at a fixed
//! header offset, so the adapter peeks it to bind the link.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use dashmap::DashMap;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};

use crate::error::{Error, Result};
use crate::protocol::{PeerId, HEADER_SIZE, PEER_ID_SIZE};
use crate::transport::ble_config::{
    AdvertisingToken, BleTransportConfig, RX_CHARACTERISTIC_UUID, SERVICE_UUID,
    TX_CHARACTERISTIC_UUID,
};
use crate::transport::bounded_queue::{BoundedQueue, OverflowBehavior, QueueConfig};
use crate::transport::{Transport, TransportEvent, TransportStats, DEFAULT_LINK_MTU};

/// Byte offset of the sender id in the fixed packet header
const SENDER_ID_OFFSET: usize = 12;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const WRITE_QUEUE_DEPTH: usize = 256;

/// Platform hook for the peripheral role: advertising the service UUID
/// with the rotating token, and accepting writes into the mesh.
#[async_trait]
pub trait BleAdvertiser: Send + Sync {
    async fn start_advertising(&self, token: AdvertisingToken) -> Result<()>;
    async fn update_token(&self, token: AdvertisingToken) -> Result<()>;
    async fn stop_advertising(&self) -> Result<()>;
}

/// Advertiser for platforms without peripheral support; central-only
/// nodes still join the mesh through links others initiate towards them.
pub struct NoopAdvertiser;

#[async_trait]
impl BleAdvertiser for NoopAdvertiser {
    async fn start_advertising(&self, _token: AdvertisingToken) -> Result<()> {
        log::warn!("peripheral role unavailable; running central-only");
        Ok(())
    }

    async fn update_token(&self, _token: AdvertisingToken) -> Result<()> {
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        Ok(())
    }
}

struct Link {
    peripheral: Peripheral,
    rx_char: Characteristic,
    mtu: usize,
    write_queue: Arc<BoundedQueue<Vec<u8>>>,
}

/// Bluetooth LE transport adapter
pub struct BleTransport {
    local_peer_id: PeerId,
    config: BleTransportConfig,
    adapter: Adapter,
    advertiser: Arc<dyn BleAdvertiser>,
    links: Arc<DashMap<PeerId, Arc<Link>>>,
    event_sender: mpsc::Sender<TransportEvent>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    running: Arc<AtomicBool>,
    self_ref: Mutex<std::sync::Weak<Self>>,
    frames_sent: AtomicU64,
    frames_received: Arc<AtomicU64>,
    bytes_sent: AtomicU64,
    bytes_received: Arc<AtomicU64>,
    send_failures: AtomicU64,
}

impl BleTransport {
    pub async fn new(local_peer_id: PeerId, config: BleTransportConfig) -> Result<Arc<Self>> {
        Self::with_advertiser(local_peer_id, config, Arc::new(NoopAdvertiser)).await
    }

    pub async fn with_advertiser(
        local_peer_id: PeerId,
        config: BleTransportConfig,
        advertiser: Arc<dyn BleAdvertiser>,
    ) -> Result<Arc<Self>> {
        let manager = Manager::new()
            .await
            .map_err(|e| Error::Transport(format!("BLE manager unavailable: {}", e)))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| Error::Transport(format!("BLE adapter enumeration failed: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Transport("no Bluetooth adapter present".to_string()))?;

        let (event_sender, event_receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let transport = Arc::new(Self {
            local_peer_id,
            config,
            adapter,
            advertiser,
            links: Arc::new(DashMap::new()),
            event_sender,
            events: Mutex::new(Some(event_receiver)),
            running: Arc::new(AtomicBool::new(false)),
            self_ref: Mutex::new(std::sync::Weak::new()),
            frames_sent: AtomicU64::new(0),
            frames_received: Arc::new(AtomicU64::new(0)),
            bytes_sent: AtomicU64::new(0),
            bytes_received: Arc::new(AtomicU64::new(0)),
            send_failures: AtomicU64::new(0),
        });
        *transport.self_ref.lock() = Arc::downgrade(&transport);
        Ok(transport)
    }

    fn spawn_scan_loop(self: Arc<Self>) {
        let transport = self;
        tokio::spawn(async move {
            let filter = ScanFilter {
                services: vec![SERVICE_UUID],
            };

            while transport.running.load(Ordering::Acquire) {
                let (window, idle) = transport.config.scan_cycle();

                if let Err(e) = transport.adapter.start_scan(filter.clone()).await {
                    log::warn!("scan start failed: {}", e);
                    tokio::time::sleep(idle).await;
                    continue;
                }

                let events = transport.adapter.events().await;
                match events {
                    Ok(mut events) => {
                        let deadline = tokio::time::Instant::now() + window;
                        loop {
                            let event =
                                tokio::time::timeout_at(deadline, events.next()).await;
                            match event {
                                Ok(Some(CentralEvent::DeviceDiscovered(id)))
                                | Ok(Some(CentralEvent::DeviceUpdated(id))) => {
                                    transport.clone().maybe_connect(id);
                                }
                                Ok(Some(_)) => {}
                                Ok(None) | Err(_) => break,
                            }
                        }
                    }
                    Err(e) => log::warn!("scan events unavailable: {}", e),
                }

                if let Err(e) = transport.adapter.stop_scan().await {
                    log::debug!("scan stop failed: {}", e);
                }
                tokio::time::sleep(idle).await;
            }
        });
    }

    fn spawn_token_rotation(self: Arc<Self>) {
        let transport = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(transport.config.token_rotation);
            tick.tick().await; // the initial token was set at start
            while transport.running.load(Ordering::Acquire) {
                tick.tick().await;
                if let Err(e) = transport
                    .advertiser
                    .update_token(AdvertisingToken::random())
                    .await
                {
                    log::debug!("advertising token rotation failed: {}", e);
                }
            }
        });
    }

    /// Attempt a connection to a discovered peripheral; already-linked
    /// devices are ignored.
    fn maybe_connect(self: Arc<Self>, id: PeripheralId) {
        tokio::spawn(async move {
            if let Err(e) = self.connect_peripheral(&id).await {
                log::debug!("connect to {:?} failed: {}", id, e);
            }
        });
    }

    async fn connect_peripheral(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self
            .adapter
            .peripheral(id)
            .await
            .map_err(|e| Error::Transport(format!("unknown peripheral: {}", e)))?;

        if peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }

        peripheral
            .connect()
            .await
            .map_err(|e| Error::Transport(format!("connect failed: {}", e)))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::Transport(format!("service discovery failed: {}", e)))?;

        let mut rx_char = None;
        let mut tx_char = None;
        for service in peripheral.services() {
            if service.uuid != SERVICE_UUID {
                continue;
            }
            for characteristic in service.characteristics {
                if characteristic.uuid == RX_CHARACTERISTIC_UUID {
                    rx_char = Some(characteristic);
                } else if characteristic.uuid == TX_CHARACTERISTIC_UUID {
                    tx_char = Some(characteristic);
                }
            }
        }
        let (rx_char, tx_char) = match (rx_char, tx_char) {
            (Some(rx), Some(tx)) => (rx, tx),
            _ => {
                let _ = peripheral.disconnect().await;
                return Err(Error::Transport(
                    "mesh characteristics missing".to_string(),
                ));
            }
        };

        peripheral
            .subscribe(&tx_char)
            .await
            .map_err(|e| Error::Transport(format!("subscribe failed: {}", e)))?;

        self.spawn_link_reader(peripheral, rx_char, format!("{:?}", id));
        Ok(())
    }

    /// Pump notifications from one peripheral; the first frame identifies
    /// the remote peer and registers the link.
    fn spawn_link_reader(
        &self,
        peripheral: Peripheral,
        rx_char: Characteristic,
        handle: String,
    ) {
        let Some(transport) = self.self_ref.lock().upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(notifications) => notifications,
                Err(e) => {
                    log::debug!("notification stream failed on {}: {}", handle, e);
                    return;
                }
            };

            let mut link_peer: Option<PeerId> = None;
            while transport.running.load(Ordering::Acquire) {
                let Some(notification) = notifications.next().await else {
                    break;
                };
                if notification.uuid != TX_CHARACTERISTIC_UUID {
                    continue;
                }
                let frame = notification.value;

                let Some(sender) = peek_sender_id(&frame) else {
                    continue; // runt frame, not even a header
                };

                if link_peer.is_none() {
                    link_peer = Some(sender);
                    transport.register_link(
                        sender,
                        peripheral.clone(),
                        rx_char.clone(),
                        handle.clone(),
                    );
                }

                transport.frames_received.fetch_add(1, Ordering::Relaxed);
                transport
                    .bytes_received
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                let event = TransportEvent::FrameReceived {
                    peer_id: link_peer.expect("set above"),
                    frame,
                };
                if transport.event_sender.try_send(event).is_err() {
                    // Saturated consumer: shed like a congested radio
                    log::debug!("inbound event queue full, frame dropped");
                }
            }

            if let Some(peer_id) = link_peer {
                transport.unregister_link(peer_id, "notification stream ended");
            }
            let _ = peripheral.disconnect().await;
        });
    }

    fn register_link(
        &self,
        peer_id: PeerId,
        peripheral: Peripheral,
        rx_char: Characteristic,
        handle: String,
    ) {
        let write_queue = Arc::new(BoundedQueue::new(QueueConfig {
            max_size: WRITE_QUEUE_DEPTH,
            overflow_behavior: OverflowBehavior::Backpressure,
            ..Default::default()
        }));

        let link = Arc::new(Link {
            peripheral,
            rx_char,
            mtu: self.config.clamp_mtu(DEFAULT_LINK_MTU),
            write_queue: write_queue.clone(),
        });
        self.links.insert(peer_id, link.clone());

        self.spawn_link_writer(peer_id, link);
        let _ = self.event_sender.try_send(TransportEvent::Connected {
            peer_id,
            handle,
        });
    }

    /// Drain the link's write queue with at most `write_credits`
    /// outstanding writes.
    fn spawn_link_writer(&self, peer_id: PeerId, link: Arc<Link>) {
        let Some(transport) = self.self_ref.lock().upgrade() else {
            return;
        };
        let credits = Arc::new(Semaphore::new(self.config.write_credits));

        tokio::spawn(async move {
            while transport.running.load(Ordering::Acquire) {
                if !transport.links.contains_key(&peer_id) {
                    break;
                }
                let frame = match tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    link.write_queue.pop(),
                )
                .await
                {
                    Ok(frame) => frame,
                    Err(_) => continue, // idle; re-check liveness
                };

                let permit = match credits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let link = link.clone();
                let transport_inner = transport.clone();
                tokio::spawn(async move {
                    let len = frame.len() as u64;
                    match link
                        .peripheral
                        .write(&link.rx_char, &frame, WriteType::WithResponse)
                        .await
                    {
                        Ok(()) => {
                            transport_inner.frames_sent.fetch_add(1, Ordering::Relaxed);
                            transport_inner.bytes_sent.fetch_add(len, Ordering::Relaxed);
                        }
                        Err(e) => {
                            transport_inner
                                .send_failures
                                .fetch_add(1, Ordering::Relaxed);
                            log::debug!("write to {} failed: {}", peer_id, e);
                        }
                    }
                    drop(permit);
                });
            }
        });
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn unregister_link(&self, peer_id: PeerId, reason: &str) {
        if self.links.remove(&peer_id).is_some() {
            let _ = self.event_sender.try_send(TransportEvent::Disconnected {
                peer_id,
                reason: reason.to_string(),
            });
        }
    }
}

/// Read the cleartext sender id straight out of the fixed packet header
fn peek_sender_id(frame: &[u8]) -> Option<PeerId> {
    if frame.len() < HEADER_SIZE {
        return None;
    }
    let mut bytes = [0u8; PEER_ID_SIZE];
    bytes.copy_from_slice(&frame[SENDER_ID_OFFSET..SENDER_ID_OFFSET + PEER_ID_SIZE]);
    Some(PeerId::from_bytes(bytes))
}

#[async_trait]
impl Transport for BleTransport {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        self.advertiser
            .start_advertising(AdvertisingToken::random())
            .await?;

        let this = self
            .self_ref
            .lock()
            .upgrade()
            .ok_or_else(|| Error::InvalidState("transport already dropped".to_string()))?;
        this.clone().spawn_scan_loop();
        this.spawn_token_rotation();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let _ = self.advertiser.stop_advertising().await;
        let _ = self.adapter.stop_scan().await;

        let peers: Vec<PeerId> = self.links.iter().map(|entry| *entry.key()).collect();
        for peer_id in peers {
            if let Some((_, link)) = self.links.remove(&peer_id) {
                let _ = link.peripheral.disconnect().await;
            }
        }
        Ok(())
    }

    async fn send(&self, peer_id: PeerId, frame: Vec<u8>) -> Result<()> {
        let link = self
            .links
            .get(&peer_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotConnected(peer_id.to_string()))?;

        if frame.len() > link.mtu {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Transport(format!(
                "frame of {} bytes exceeds link MTU {}",
                frame.len(),
                link.mtu
            )));
        }

        if !link.write_queue.push(frame).await {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Backpressure(format!(
                "write queue to {} full",
                peer_id
            )));
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.lock().take()
    }

    fn mtu(&self, peer_id: &PeerId) -> usize {
        self.links
            .get(peer_id)
            .map(|entry| entry.mtu)
            .unwrap_or_else(|| self.config.clamp_mtu(DEFAULT_LINK_MTU))
    }

    fn linked_peers(&self) -> Vec<PeerId> {
        self.links.iter().map(|entry| *entry.key()).collect()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            link_count: self.links.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_sender_id() {
        use crate::protocol::binary::BinaryProtocol;
        use crate::protocol::{BitchatPacket, PacketType};

        let sender = PeerId::from_bytes([0xAB; 8]);
        let packet = BitchatPacket::new_broadcast(PacketType::Announce, sender, vec![1, 2, 3]);
        let frame = BinaryProtocol::encode(&packet);

        assert_eq!(peek_sender_id(&frame), Some(sender));
        assert_eq!(peek_sender_id(&frame[..10]), None);
    }
}
