//! Mesh networking for BitChat
//!
//! This module implements the mesh layer between the transport and the
//! application:
//! - Inbound decision pipeline: decode, anti-replay, dedup, signature
//!   check, local delivery, relay
//! - Probabilistic epidemic flood with per-relay jitter and a relay rate
//!   cap, scaled by the power-state hint
//! - Store-and-forward for direct messages to offline recipients
//! - Peer registry bookkeeping and liveness sweeps
//! - Noise handshake orchestration and transport envelope handling

pub mod deduplication;
pub mod registry;
pub mod store_forward;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::crypto::{self, BitchatIdentity};
use crate::error::{Error, Result};
use crate::protocol::binary::BinaryProtocol;
use crate::protocol::fragment::{Fragmenter, Reassembler, ReassemblyResult};
use crate::protocol::tlv::{self, AnnouncePayload, MessagePayload};
use crate::protocol::{
    unix_time_ms, BitchatPacket, Fingerprint, MessageId, PacketType, PeerId, MAX_RELAY_PPS,
    MAX_TTL, OFFLINE_QUEUE_PER_RECIPIENT, RELAY_JITTER_MS, REPLAY_WINDOW_MS, TARGET_FANOUT,
};
use crate::session::SessionManager;
use crate::transport::{PowerMode, Transport, TransportEvent};
use deduplication::MessageDeduplicator;
use registry::{PeerRegistry, PeerRegistryEvent};
use store_forward::OfflineStore;

/// Events surfaced to the application layer
#[derive(Debug, Clone)]
pub enum MeshEvent {
    MessageReceived {
        from: PeerId,
        nickname: Option<String>,
        content: String,
        channel: Option<String>,
        message_id: MessageId,
    },
    PeerAuthenticated {
        peer_id: PeerId,
        fingerprint: Fingerprint,
    },
    PeerLost {
        peer_id: PeerId,
    },
    DeliveryAck {
        message_id: MessageId,
        peer_id: PeerId,
    },
    ReassemblyFailed {
        message_id: MessageId,
    },
    HandshakeFailed {
        peer_id: PeerId,
    },
}

/// Router counters for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshStats {
    pub frames_received: u64,
    pub decode_errors: u64,
    pub replay_dropped: u64,
    pub duplicates_dropped: u64,
    pub signature_failures: u64,
    pub delivered: u64,
    pub relayed: u64,
    pub relay_dropped_budget: u64,
    pub relay_dropped_power: u64,
}

/// Router tuning knobs
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// TTL stamped on originated packets (testing override; wire max is
    /// [`MAX_TTL`])
    pub max_ttl: u8,
    pub power_mode: PowerMode,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_ttl: MAX_TTL,
            power_mode: PowerMode::default(),
        }
    }
}

/// Relay parameters after power scaling
struct RelayParams {
    fanout: usize,
    jitter_ms: u64,
    max_pps: u32,
    broadcasts: bool,
}

fn relay_params(mode: PowerMode) -> RelayParams {
    match mode {
        PowerMode::Performance => RelayParams {
            fanout: TARGET_FANOUT,
            jitter_ms: RELAY_JITTER_MS,
            max_pps: MAX_RELAY_PPS,
            broadcasts: true,
        },
        PowerMode::Balanced => RelayParams {
            fanout: TARGET_FANOUT,
            jitter_ms: 150,
            max_pps: 35,
            broadcasts: true,
        },
        PowerMode::PowerSaver => RelayParams {
            fanout: 2,
            jitter_ms: 100,
            max_pps: 20,
            broadcasts: true,
        },
        PowerMode::UltraLow => RelayParams {
            fanout: 1,
            jitter_ms: 50,
            max_pps: 5,
            broadcasts: false,
        },
    }
}

struct RelayBudget {
    window_start: Instant,
    spent: u32,
}

/// Mesh service: the router plus the component state it consults
pub struct MeshService {
    identity: Arc<BitchatIdentity>,
    sessions: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
    config: MeshConfig,
    dedup: Mutex<MessageDeduplicator>,
    reassembler: Mutex<Reassembler>,
    registry: Mutex<PeerRegistry>,
    offline: Mutex<OfflineStore>,
    /// Encoded inner packets awaiting session establishment (or an
    /// offline peer's return), per peer
    pending_plaintext: Mutex<HashMap<PeerId, VecDeque<Vec<u8>>>>,
    /// Serializes encrypt-then-send per peer so transport order matches
    /// nonce order
    send_locks: Mutex<HashMap<PeerId, Arc<tokio::sync::Mutex<()>>>>,
    power_mode: RwLock<PowerMode>,
    relay_budget: Mutex<RelayBudget>,
    event_sender: mpsc::UnboundedSender<MeshEvent>,
    running: AtomicBool,
    self_ref: Mutex<std::sync::Weak<MeshService>>,
    stats: Mutex<MeshStats>,
}

impl MeshService {
    pub fn new(
        identity: Arc<BitchatIdentity>,
        transport: Arc<dyn Transport>,
        config: MeshConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MeshEvent>) {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let sessions = Arc::new(SessionManager::new(identity.clone()));
        let power_mode = config.power_mode;

        let service = Arc::new(Self {
            identity,
            sessions,
            transport,
            config,
            dedup: Mutex::new(MessageDeduplicator::new()),
            reassembler: Mutex::new(Reassembler::new()),
            registry: Mutex::new(PeerRegistry::new()),
            offline: Mutex::new(OfflineStore::new()),
            pending_plaintext: Mutex::new(HashMap::new()),
            send_locks: Mutex::new(HashMap::new()),
            power_mode: RwLock::new(power_mode),
            relay_budget: Mutex::new(RelayBudget {
                window_start: Instant::now(),
                spent: 0,
            }),
            event_sender,
            running: AtomicBool::new(false),
            self_ref: Mutex::new(std::sync::Weak::new()),
            stats: Mutex::new(MeshStats::default()),
        });
        *service.self_ref.lock() = Arc::downgrade(&service);

        (service, event_receiver)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Start the transport, the event pump and the maintenance sweeps
    pub async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        self.transport.start().await?;

        let events = self
            .transport
            .take_events()
            .ok_or_else(|| Error::InvalidState("transport events already taken".to_string()))?;
        self.spawn_event_pump(events);
        self.spawn_maintenance();

        log::info!("mesh service started, peer id {}", self.local_peer_id());
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.transport.stop().await
    }

    fn spawn_event_pump(&self, mut events: mpsc::Receiver<TransportEvent>) {
        let Some(service) = self.self_ref.lock().upgrade() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !service.running.load(Ordering::Acquire) {
                    break;
                }
                service.handle_transport_event(event).await;
            }
        });
    }

    fn spawn_maintenance(&self) {
        let Some(service) = self.self_ref.lock().upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                if !service.running.load(Ordering::Acquire) {
                    break;
                }
                service.run_maintenance(Instant::now());
            }
        });
    }

    /// One sweep over every time-driven concern
    pub fn run_maintenance(&self, now: Instant) {
        for message_id in self.reassembler.lock().purge_expired(now) {
            self.emit(MeshEvent::ReassemblyFailed { message_id });
        }

        for event in self.registry.lock().evict_stale(now) {
            if let PeerRegistryEvent::PeerLost { peer_id } = event {
                self.sessions.close(peer_id);
                self.pending_plaintext.lock().remove(&peer_id);
                self.emit(MeshEvent::PeerLost { peer_id });
            }
        }

        let sweep = self.sessions.expire(now);
        for peer_id in sweep.handshake_failed {
            self.pending_plaintext.lock().remove(&peer_id);
            self.emit(MeshEvent::HandshakeFailed { peer_id });
        }
        // Expired established sessions re-handshake lazily on next use
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer_id, handle } => {
                log::debug!("link up to {} via {}", peer_id, handle);
                self.registry
                    .lock()
                    .mark_connected(peer_id, Some(handle), Instant::now());
                // A returning peer with a live session gets its queued
                // traffic immediately; otherwise the drain waits for
                // authentication
                if self.sessions.is_established(peer_id) {
                    self.drain_offline(peer_id).await;
                    self.drain_pending_plaintext(peer_id).await;
                }
            }
            TransportEvent::Disconnected { peer_id, reason } => {
                log::debug!("link to {} dropped: {}", peer_id, reason);
                self.registry.lock().mark_disconnected(peer_id);
            }
            TransportEvent::FrameReceived { peer_id, frame } => {
                self.handle_frame(peer_id, &frame).await;
            }
            TransportEvent::Error { peer_id, message } => {
                log::warn!("transport error (peer {:?}): {}", peer_id, message);
            }
        }
    }

    /// Entry point for raw frames off a link
    pub async fn handle_frame(&self, from_link: PeerId, frame: &[u8]) {
        self.stats.lock().frames_received += 1;

        let packet = match BinaryProtocol::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.lock().decode_errors += 1;
                log::debug!("dropping undecodable frame from {}: {}", from_link, e);
                return;
            }
        };

        self.process_packet(from_link, packet, true).await;
    }

    fn process_packet_boxed<'a>(
        &'a self,
        from_link: PeerId,
        packet: BitchatPacket,
        from_wire: bool,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.process_packet(from_link, packet, from_wire))
    }

    /// The router decision pipeline.
    ///
    /// `from_wire` is false for packets recovered from reassembly or a
    /// Noise envelope; those skip the replay window (their outer carrier
    /// already passed it) and are never relayed again.
    async fn process_packet(&self, from_link: PeerId, packet: BitchatPacket, from_wire: bool) {
        let local_id = self.local_peer_id();
        if packet.sender_id == local_id {
            return; // our own emission echoed back
        }

        if from_wire {
            let now_ms = unix_time_ms();
            if now_ms.abs_diff(packet.timestamp_ms) > REPLAY_WINDOW_MS {
                self.stats.lock().replay_dropped += 1;
                log::debug!(
                    "dropping packet outside replay window ({}ms skew)",
                    now_ms.abs_diff(packet.timestamp_ms)
                );
                return;
            }
        }

        if !self
            .dedup
            .lock()
            .should_process(packet.message_id, unix_time_ms() / 1000)
        {
            self.stats.lock().duplicates_dropped += 1;
            return;
        }

        // Announce packets authenticate against their embedded key during
        // delivery; everything else verifies against the registry when the
        // sender's signing key is known.
        if packet.signature.is_some() && packet.packet_type != PacketType::Announce {
            let known_key = self.registry.lock().signing_key_of(&packet.sender_id);
            if let Some(key) = known_key {
                if crypto::verify_packet(&packet, &key).is_err() {
                    self.stats.lock().signature_failures += 1;
                    return;
                }
            }
        }

        self.registry.lock().touch(packet.sender_id, Instant::now());

        let for_us = packet
            .recipient_id
            .map(|recipient| recipient == local_id)
            .unwrap_or(true);

        if for_us {
            self.deliver(from_link, &packet).await;
        }

        // Directed traffic that reached its recipient stops here
        let relay_candidate = packet.is_broadcast() || !for_us;
        if from_wire && relay_candidate {
            self.relay(packet, from_link).await;
        }
    }

    /// Local delivery by packet type
    async fn deliver(&self, from_link: PeerId, packet: &BitchatPacket) {
        match packet.packet_type {
            PacketType::Announce => self.deliver_announce(packet),
            PacketType::Message => self.deliver_message(packet).await,
            PacketType::Ack => {
                if let Ok(message_id) = tlv::decode_ack(&packet.payload) {
                    self.stats.lock().delivered += 1;
                    self.emit(MeshEvent::DeliveryAck {
                        message_id,
                        peer_id: packet.sender_id,
                    });
                }
            }
            PacketType::Leave => {
                let removed = self.registry.lock().remove(packet.sender_id);
                self.sessions.close(packet.sender_id);
                if removed.is_some() {
                    self.emit(MeshEvent::PeerLost {
                        peer_id: packet.sender_id,
                    });
                }
            }
            PacketType::Fragment => self.deliver_fragment(from_link, packet).await,
            PacketType::NoiseHandshakeInit => self.deliver_handshake_init(packet).await,
            PacketType::NoiseHandshakeResp => self.deliver_handshake_resp(packet).await,
            PacketType::NoiseHandshakeFinal => self.deliver_handshake_final(packet).await,
            PacketType::NoiseTransport => self.deliver_noise_transport(from_link, packet).await,
        }
    }

    fn deliver_announce(&self, packet: &BitchatPacket) {
        let payload = match AnnouncePayload::decode(&packet.payload) {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("malformed announce from {}: {}", packet.sender_id, e);
                return;
            }
        };

        // The announce must be signed by the key it distributes
        if crypto::verify_packet(packet, &payload.signing_key).is_err() {
            self.stats.lock().signature_failures += 1;
            return;
        }

        let result = self.registry.lock().learn_identity(
            packet.sender_id,
            payload.noise_static_key,
            payload.signing_key,
            Some(payload.nickname),
            Instant::now(),
        );
        match result {
            Ok(Some(PeerRegistryEvent::PeerAdded { peer_id })) => {
                log::info!("discovered peer {}", peer_id);
            }
            Ok(_) => {}
            Err(e) => log::debug!("rejecting announce from {}: {}", packet.sender_id, e),
        }
    }

    async fn deliver_message(&self, packet: &BitchatPacket) {
        let payload = match MessagePayload::decode(&packet.payload) {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("malformed message from {}: {}", packet.sender_id, e);
                return;
            }
        };

        self.stats.lock().delivered += 1;
        self.emit(MeshEvent::MessageReceived {
            from: packet.sender_id,
            nickname: payload.nickname,
            content: payload.content,
            channel: payload.channel,
            message_id: packet.message_id,
        });

        // Direct messages are acknowledged towards the sender
        if packet.recipient_id.is_some() {
            if let Err(e) = self.send_ack(packet.sender_id, packet.message_id).await {
                log::debug!("could not ack {} to {}: {}", packet.message_id, packet.sender_id, e);
            }
        }
    }

    async fn deliver_fragment(&self, from_link: PeerId, packet: &BitchatPacket) {
        let outcome = self.reassembler.lock().insert(&packet.payload, Instant::now());
        match outcome {
            Ok(ReassemblyResult::Complete(payload)) => match BinaryProtocol::decode(&payload) {
                Ok(inner) => self.process_packet_boxed(from_link, inner, false).await,
                Err(e) => {
                    self.stats.lock().decode_errors += 1;
                    log::debug!("reassembled payload failed to decode: {}", e);
                }
            },
            Ok(_) => {}
            Err(e) => log::debug!("fragment from {} rejected: {}", packet.sender_id, e),
        }
    }

    async fn deliver_handshake_init(&self, packet: &BitchatPacket) {
        let peer = packet.sender_id;
        match self
            .sessions
            .on_handshake_init(peer, &packet.payload, Instant::now())
        {
            Ok(Some(msg2)) => {
                let response = BitchatPacket::new_direct(
                    PacketType::NoiseHandshakeResp,
                    self.local_peer_id(),
                    peer,
                    msg2,
                );
                if let Err(e) = self.route_packet(response).await {
                    log::debug!("could not send handshake response to {}: {}", peer, e);
                }
            }
            Ok(None) => {
                log::debug!("discarding concurrent handshake init from {}", peer);
            }
            Err(e) => {
                log::debug!("handshake init from {} failed: {}", peer, e);
                self.emit(MeshEvent::HandshakeFailed { peer_id: peer });
            }
        }
    }

    async fn deliver_handshake_resp(&self, packet: &BitchatPacket) {
        let peer = packet.sender_id;
        match self
            .sessions
            .on_handshake_resp(peer, &packet.payload, Instant::now())
        {
            Ok(msg3) => {
                let final_msg = BitchatPacket::new_direct(
                    PacketType::NoiseHandshakeFinal,
                    self.local_peer_id(),
                    peer,
                    msg3,
                );
                if let Err(e) = self.route_packet(final_msg).await {
                    log::debug!("could not send handshake final to {}: {}", peer, e);
                }
                self.finish_establishment(peer).await;
            }
            Err(e) => {
                log::debug!("handshake response from {} failed: {}", peer, e);
                self.emit(MeshEvent::HandshakeFailed { peer_id: peer });
            }
        }
    }

    async fn deliver_handshake_final(&self, packet: &BitchatPacket) {
        let peer = packet.sender_id;
        match self
            .sessions
            .on_handshake_final(peer, &packet.payload, Instant::now())
        {
            Ok(()) => self.finish_establishment(peer).await,
            Err(e) => {
                log::debug!("handshake final from {} failed: {}", peer, e);
                self.emit(MeshEvent::HandshakeFailed { peer_id: peer });
            }
        }
    }

    async fn deliver_noise_transport(&self, from_link: PeerId, packet: &BitchatPacket) {
        let peer = packet.sender_id;
        let plaintext = match self.sessions.decrypt(peer, &packet.payload, Instant::now()) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                // Desynchronized or tampered: the manager already tore the
                // session down. Silent towards the network.
                log::debug!("transport decrypt from {} failed: {}", peer, e);
                return;
            }
        };

        match BinaryProtocol::decode(&plaintext) {
            Ok(inner) => self.process_packet_boxed(from_link, inner, false).await,
            Err(e) => {
                self.stats.lock().decode_errors += 1;
                log::debug!("decrypted envelope from {} undecodable: {}", peer, e);
            }
        }
    }

    /// Post-handshake bookkeeping: registry state, queued traffic
    async fn finish_establishment(&self, peer: PeerId) {
        let Some(remote_static) = self.sessions.remote_static_of(peer) else {
            return;
        };

        let event = self
            .registry
            .lock()
            .mark_authenticated(peer, remote_static, Instant::now());
        match event {
            Ok(PeerRegistryEvent::PeerAuthenticated { peer_id, fingerprint }) => {
                self.emit(MeshEvent::PeerAuthenticated {
                    peer_id,
                    fingerprint,
                });
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("authenticated peer {} rejected by registry: {}", peer, e);
                self.sessions.close(peer);
                return;
            }
        }

        self.drain_offline(peer).await;
        self.drain_pending_plaintext(peer).await;
    }

    /// Encrypt and flush plaintext that waited for the session (or the
    /// peer's link) to come back, in arrival order
    async fn drain_pending_plaintext(&self, peer: PeerId) {
        let pending = self
            .pending_plaintext
            .lock()
            .remove(&peer)
            .unwrap_or_default();
        for inner_bytes in pending {
            if let Err(e) = self.wrap_and_route(peer, inner_bytes).await {
                log::debug!("queued direct send to {} failed: {}", peer, e);
            }
        }
    }

    /// Store-and-forward drain in arrival order. Unsigned envelopes get a
    /// fresh timestamp so the recipient's replay window accepts them;
    /// signed packets are immutable and keep their original one.
    async fn drain_offline(&self, peer: PeerId) {
        let queued = self.offline.lock().drain(peer);
        for mut packet in queued {
            if packet.signature.is_none() {
                packet.timestamp_ms = unix_time_ms();
            }
            if let Err(e) = self.route_packet(packet).await {
                log::debug!("offline drain to {} failed: {}", peer, e);
            }
        }
    }

    /// Relay stage: TTL, power scaling, rate cap, probabilistic flood
    async fn relay(&self, mut packet: BitchatPacket, from_link: PeerId) {
        packet.decrement_ttl();
        if packet.ttl == 0 {
            return;
        }

        let params = relay_params(*self.power_mode.read());

        // Store-and-forward for known-but-offline direct recipients
        if let Some(recipient) = packet.recipient_id {
            if is_queueable(packet.packet_type) {
                let registry = self.registry.lock();
                if registry.is_known(&recipient) && !registry.is_connected(&recipient) {
                    drop(registry);
                    self.offline.lock().enqueue(recipient, packet.clone());
                }
            }
        }

        let targets = {
            let registry = self.registry.lock();
            if let Some(recipient) = packet.recipient_id {
                if registry.is_connected(&recipient) {
                    vec![recipient]
                } else if params.broadcasts {
                    registry.connected_peers()
                } else {
                    // UltraLow: no flood for unreachable recipients
                    self.stats.lock().relay_dropped_power += 1;
                    return;
                }
            } else if params.broadcasts {
                registry.connected_peers()
            } else {
                self.stats.lock().relay_dropped_power += 1;
                return;
            }
        };

        let candidates: Vec<PeerId> = targets
            .into_iter()
            .filter(|peer| *peer != from_link && *peer != packet.sender_id)
            .collect();
        if candidates.is_empty() {
            return;
        }

        if !self.take_relay_budget(params.max_pps) {
            self.stats.lock().relay_dropped_budget += 1;
            return;
        }

        // Per-peer forwarding probability p = min(1, k/n) bounds the storm
        let n = candidates.len();
        let p = (params.fanout as f64 / n as f64).min(1.0);
        let mut relayed_any = false;

        for target in candidates {
            if n > params.fanout && fastrand::f64() >= p {
                continue;
            }
            relayed_any = true;

            let Some(service) = self.self_ref.lock().upgrade() else {
                return;
            };
            let jitter = Duration::from_millis(fastrand::u64(0..=params.jitter_ms));
            let packet = packet.clone();
            tokio::spawn(async move {
                tokio::time::sleep(jitter).await;
                if let Err(e) = service.send_packet(target, &packet).await {
                    log::debug!("relay to {} failed: {}", target, e);
                }
            });
        }

        if relayed_any {
            self.stats.lock().relayed += 1;
        }
    }

    fn take_relay_budget(&self, max_pps: u32) -> bool {
        let mut budget = self.relay_budget.lock();
        let now = Instant::now();
        if now.duration_since(budget.window_start) >= Duration::from_secs(1) {
            budget.window_start = now;
            budget.spent = 0;
        }
        if budget.spent >= max_pps {
            return false;
        }
        budget.spent += 1;
        true
    }

    // ---- outbound paths -------------------------------------------------

    /// Broadcast a chat message into the mesh
    pub async fn send_broadcast(
        &self,
        content: &str,
        nickname: Option<String>,
    ) -> Result<MessageId> {
        let payload = MessagePayload {
            nickname,
            content: content.to_string(),
            ..Default::default()
        };
        let mut packet = BitchatPacket::new_broadcast(
            PacketType::Message,
            self.local_peer_id(),
            payload.encode()?,
        );
        packet.ttl = self.config.max_ttl;
        self.identity.sign_packet(&mut packet);

        let message_id = packet.message_id;
        self.mark_own(message_id);
        self.broadcast_to_neighbors(&packet).await;
        Ok(message_id)
    }

    /// Send an encrypted direct message; queues and handshakes as needed.
    ///
    /// Returns the inner message id, which the recipient's Ack will echo.
    pub async fn send_direct(
        &self,
        recipient: PeerId,
        content: &str,
        nickname: Option<String>,
    ) -> Result<MessageId> {
        if recipient == self.local_peer_id() {
            return Err(Error::InvalidInput("cannot message ourselves".to_string()));
        }

        let payload = MessagePayload {
            nickname,
            content: content.to_string(),
            ..Default::default()
        };
        let mut inner = BitchatPacket::new_direct(
            PacketType::Message,
            self.local_peer_id(),
            recipient,
            payload.encode()?,
        );
        inner.ttl = self.config.max_ttl;
        self.identity.sign_packet(&mut inner);
        let message_id = inner.message_id;
        let inner_bytes = BinaryProtocol::encode(&inner);

        if self.sessions.is_established(recipient) {
            self.wrap_and_route(recipient, inner_bytes).await?;
            return Ok(message_id);
        }

        if !self.registry.lock().is_known(&recipient) {
            return Err(Error::NotConnected(recipient.to_string()));
        }

        // Queue the plaintext until the session exists, then start (or
        // wait out the backoff of) a handshake.
        self.queue_plaintext(recipient, inner_bytes);
        self.try_initiate_handshake(recipient).await;
        Ok(message_id)
    }

    /// Broadcast our presence beacon
    pub async fn announce(&self, nickname: &str) -> Result<()> {
        let payload = AnnouncePayload {
            nickname: nickname.to_string(),
            noise_static_key: self.identity.noise_keypair.public_bytes(),
            signing_key: self.identity.signing_keypair.public_bytes(),
            capabilities: 0,
        };
        let mut packet = BitchatPacket::new_broadcast(
            PacketType::Announce,
            self.local_peer_id(),
            payload.encode()?,
        );
        packet.ttl = self.config.max_ttl;
        self.identity.sign_packet(&mut packet);

        self.mark_own(packet.message_id);
        self.broadcast_to_neighbors(&packet).await;
        Ok(())
    }

    /// Graceful departure: tell the mesh, then drop sessions
    pub async fn leave(&self) -> Result<()> {
        let mut packet =
            BitchatPacket::new_broadcast(PacketType::Leave, self.local_peer_id(), Vec::new());
        packet.ttl = self.config.max_ttl;
        self.identity.sign_packet(&mut packet);

        self.mark_own(packet.message_id);
        self.broadcast_to_neighbors(&packet).await;
        Ok(())
    }

    /// Tear down state for one peer on request
    pub async fn disconnect(&self, peer: PeerId) -> Result<()> {
        self.sessions.close(peer);
        self.pending_plaintext.lock().remove(&peer);
        let removed = self.registry.lock().remove(peer);
        if removed.is_some() {
            self.emit(MeshEvent::PeerLost { peer_id: peer });
        }
        Ok(())
    }

    /// Emergency wipe: zeroize sessions, forget everything, stop the radio
    pub async fn panic_wipe(&self) {
        log::warn!("panic wipe engaged");
        self.sessions.panic_wipe();
        self.dedup.lock().clear(unix_time_ms() / 1000);
        self.reassembler.lock().clear();
        self.offline.lock().clear();
        self.pending_plaintext.lock().clear();
        self.send_locks.lock().clear();
        self.registry.lock().clear();
        self.running.store(false, Ordering::Release);
        let _ = self.transport.stop().await;
    }

    pub fn set_power_mode(&self, mode: PowerMode) {
        *self.power_mode.write() = mode;
    }

    pub fn power_mode(&self) -> PowerMode {
        *self.power_mode.read()
    }

    pub fn stats(&self) -> MeshStats {
        *self.stats.lock()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.registry.lock().connected_peers()
    }

    pub fn nickname_of(&self, peer: &PeerId) -> Option<String> {
        self.registry
            .lock()
            .get(peer)
            .and_then(|record| record.nickname.clone())
    }

    // ---- helpers --------------------------------------------------------

    fn emit(&self, event: MeshEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Record an id we originated so echoes are suppressed
    fn mark_own(&self, message_id: MessageId) {
        self.dedup
            .lock()
            .insert_local(message_id, unix_time_ms() / 1000);
    }

    async fn send_ack(&self, to: PeerId, message_id: MessageId) -> Result<()> {
        let mut inner = BitchatPacket::new_direct(
            PacketType::Ack,
            self.local_peer_id(),
            to,
            tlv::encode_ack(&message_id),
        );
        inner.ttl = self.config.max_ttl;
        self.identity.sign_packet(&mut inner);

        if self.sessions.is_established(to) {
            let inner_bytes = BinaryProtocol::encode(&inner);
            self.wrap_and_route(to, inner_bytes).await
        } else {
            self.mark_own(inner.message_id);
            self.route_packet(inner).await
        }
    }

    /// Encrypt an encoded inner packet and send the Noise envelope.
    ///
    /// The per-peer send lock keeps transport order identical to nonce
    /// order; a ciphertext overtaking an earlier one would fail
    /// authentication and tear the session down. Envelopes are only
    /// minted while the peer is reachable: encrypting towards an offline
    /// peer would freeze a nonce that later traffic could overtake, so
    /// the plaintext waits instead.
    async fn wrap_and_route(&self, peer: PeerId, inner_bytes: Vec<u8>) -> Result<()> {
        // One Noise message carries the whole inner packet; fragmentation
        // happens below this layer, on the envelope
        if inner_bytes.len() + 16 > crate::session::noise::NOISE_MAX_MESSAGE {
            return Err(Error::InvalidInput(
                "inner packet exceeds one Noise envelope".to_string(),
            ));
        }

        let lock = self.send_lock(peer);
        let _guard = lock.lock().await;

        if !self.registry.lock().is_connected(&peer) {
            self.queue_plaintext(peer, inner_bytes);
            return Ok(());
        }

        let ciphertext = self.sessions.encrypt(peer, &inner_bytes, Instant::now())?;
        let envelope = BitchatPacket::new_direct(
            PacketType::NoiseTransport,
            self.local_peer_id(),
            peer,
            ciphertext,
        );
        self.mark_own(envelope.message_id);
        self.route_packet(envelope).await
    }

    fn send_lock(&self, peer: PeerId) -> Arc<tokio::sync::Mutex<()>> {
        self.send_locks
            .lock()
            .entry(peer)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn queue_plaintext(&self, peer: PeerId, inner_bytes: Vec<u8>) {
        let mut pending = self.pending_plaintext.lock();
        let queue = pending.entry(peer).or_default();
        if queue.len() >= OFFLINE_QUEUE_PER_RECIPIENT {
            queue.pop_front();
        }
        queue.push_back(inner_bytes);
    }

    async fn try_initiate_handshake(&self, peer: PeerId) {
        let now = Instant::now();
        if self.sessions.is_established(peer) || !self.sessions.can_initiate(peer, now) {
            return;
        }
        match self.sessions.initiate(peer, now) {
            Ok(msg1) => {
                let packet = BitchatPacket::new_direct(
                    PacketType::NoiseHandshakeInit,
                    self.local_peer_id(),
                    peer,
                    msg1,
                );
                if let Err(e) = self.route_packet(packet).await {
                    log::debug!("could not send handshake init to {}: {}", peer, e);
                }
            }
            Err(e) => log::debug!("handshake initiation to {} refused: {}", peer, e),
        }
    }

    /// Route a locally created directed packet: straight to a connected
    /// recipient, queued for a known offline one, flooded otherwise.
    async fn route_packet(&self, packet: BitchatPacket) -> Result<()> {
        self.mark_own(packet.message_id);

        let Some(recipient) = packet.recipient_id else {
            self.broadcast_to_neighbors(&packet).await;
            return Ok(());
        };

        let (connected, known) = {
            let registry = self.registry.lock();
            (registry.is_connected(&recipient), registry.is_known(&recipient))
        };

        if connected {
            return self.send_packet(recipient, &packet).await;
        }

        if known && is_queueable(packet.packet_type) {
            self.offline.lock().enqueue(recipient, packet.clone());
        }

        // Multi-hop reach: flood with the recipient set; relays converge
        self.broadcast_to_neighbors(&packet).await;
        Ok(())
    }

    async fn broadcast_to_neighbors(&self, packet: &BitchatPacket) {
        let neighbors = self.registry.lock().connected_peers();
        if neighbors.is_empty() {
            return;
        }

        // Fragment once against the most constrained link so every
        // neighbor sees identical fragment ids and dedup works downstream
        let min_mtu = neighbors
            .iter()
            .map(|peer| self.transport.mtu(peer))
            .min()
            .unwrap_or(crate::transport::DEFAULT_LINK_MTU);
        let frames = match self.frames_for(packet, min_mtu) {
            Ok(frames) => frames,
            Err(e) => {
                log::debug!("could not frame packet for broadcast: {}", e);
                return;
            }
        };

        for peer in neighbors {
            if peer == packet.sender_id {
                continue;
            }
            for frame in &frames {
                if let Err(e) = self.transport.send(peer, frame.clone()).await {
                    log::debug!("send to {} failed: {}", peer, e);
                }
            }
        }
    }

    /// Encode for one link, fragmenting when the frame exceeds its MTU
    async fn send_packet(&self, target: PeerId, packet: &BitchatPacket) -> Result<()> {
        let mtu = self.transport.mtu(&target);
        for frame in self.frames_for(packet, mtu)? {
            self.transport.send(target, frame).await?;
        }
        Ok(())
    }

    /// Wire frames for one packet under an MTU: the encoded packet itself,
    /// or a train of fragment packets carrying slices of it
    fn frames_for(&self, packet: &BitchatPacket, mtu: usize) -> Result<Vec<Vec<u8>>> {
        let encoded = BinaryProtocol::encode(packet);
        if encoded.len() <= mtu {
            return Ok(vec![encoded]);
        }

        let chunk_size = Fragmenter::chunk_capacity(mtu, packet.recipient_id.is_some());
        if chunk_size == 0 {
            return Err(Error::Transport(format!(
                "link MTU {} too small to carry fragments",
                mtu
            )));
        }
        let fragments = Fragmenter::split(packet.message_id, &encoded, chunk_size)
            .map_err(Error::Decode)?
            .ok_or_else(|| Error::Internal("oversize frame did not fragment".to_string()))?;

        let mut frames = Vec::with_capacity(fragments.len());
        for chunk in fragments {
            let mut fragment_packet = match packet.recipient_id {
                Some(recipient) => BitchatPacket::new_direct(
                    PacketType::Fragment,
                    self.local_peer_id(),
                    recipient,
                    chunk,
                ),
                None => BitchatPacket::new_broadcast(
                    PacketType::Fragment,
                    self.local_peer_id(),
                    chunk,
                ),
            };
            fragment_packet.ttl = self.config.max_ttl;
            self.mark_own(fragment_packet.message_id);
            frames.push(BinaryProtocol::encode(&fragment_packet));
        }
        Ok(frames)
    }
}

/// Packet types eligible for the offline store. Handshake traffic is
/// ephemeral; replaying a stale handshake message after establishment
/// would clobber the fresh session.
fn is_queueable(packet_type: PacketType) -> bool {
    matches!(
        packet_type,
        PacketType::Message | PacketType::Ack | PacketType::NoiseTransport
    )
}
