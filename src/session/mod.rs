//! Noise session management for BitChat
//!
//! This module owns every piece of key material in the node:
//! - Noise XX handshake state machines, one per peer
//! - Transport cipher pairs for established sessions
//! - Handshake backoff, timeouts and rekey accounting
//!
//! Callers never see keys; they hand plaintext/ciphertext to the manager
//! and get the transformed bytes back. Concurrent initiations converge via
//! a peer-id tie-break: the lexicographically smaller peer id is the
//! initiator.

pub mod noise;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::crypto::{validation, BitchatIdentity};
use crate::error::{Error, Result};
use crate::protocol::{
    Fingerprint, PeerId, HANDSHAKE_BACKOFF_INITIAL, HANDSHAKE_BACKOFF_MAX, HANDSHAKE_TIMEOUT,
    REKEY_INTERVAL, REKEY_MESSAGES, SESSION_TIMEOUT,
};
use noise::NoiseSession;

/// Handshake progress for a peer. Absence from the session map is the
/// implicit `None` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// We sent msg1 and wait for msg2
    AwaitResp,
    /// We answered msg1 with msg2 and wait for msg3
    AwaitFinal,
    /// Transport ciphers derived
    Established,
}

/// Session limits, overridable for tests
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub handshake_timeout: Duration,
    pub session_timeout: Duration,
    pub rekey_messages: u64,
    pub rekey_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            session_timeout: SESSION_TIMEOUT,
            rekey_messages: REKEY_MESSAGES,
            rekey_interval: REKEY_INTERVAL,
            backoff_initial: HANDSHAKE_BACKOFF_INITIAL,
            backoff_max: HANDSHAKE_BACKOFF_MAX,
        }
    }
}

struct PeerSession {
    noise: NoiseSession,
    phase: SessionPhase,
    last_progress: Instant,
    established_at: Option<Instant>,
    last_activity: Instant,
    sent_since_rekey: u64,
    received_since_rekey: u64,
    traffic_seen: bool,
}

impl PeerSession {
    fn new(noise: NoiseSession, phase: SessionPhase, now: Instant) -> Self {
        Self {
            noise,
            phase,
            last_progress: now,
            established_at: None,
            last_activity: now,
            sent_since_rekey: 0,
            received_since_rekey: 0,
            traffic_seen: false,
        }
    }
}

struct Backoff {
    until: Instant,
    delay: Duration,
}

/// Counters surfaced for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub handshakes_started: u64,
    pub handshakes_completed: u64,
    pub handshakes_failed: u64,
    pub sessions_torn_down: u64,
    pub rekeys: u64,
}

/// Result of a timeout sweep
#[derive(Debug, Default)]
pub struct SessionSweep {
    /// Handshakes that stalled past the timeout; backoff engaged
    pub handshake_failed: Vec<PeerId>,
    /// Established sessions removed (age or idle expiry); the next send
    /// triggers a fresh handshake
    pub expired: Vec<PeerId>,
}

struct Inner {
    sessions: HashMap<PeerId, PeerSession>,
    backoff: HashMap<PeerId, Backoff>,
    stats: SessionStats,
}

/// Sole owner of Noise key material, keyed by peer id.
pub struct SessionManager {
    identity: Arc<BitchatIdentity>,
    limits: SessionLimits,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(identity: Arc<BitchatIdentity>) -> Self {
        Self::with_limits(identity, SessionLimits::default())
    }

    pub fn with_limits(identity: Arc<BitchatIdentity>, limits: SessionLimits) -> Self {
        Self {
            identity,
            limits,
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                backoff: HashMap::new(),
                stats: SessionStats::default(),
            }),
        }
    }

    /// Wire peer id of this node
    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Start a handshake with `peer`, returning msg1 bytes to send.
    ///
    /// A pending handshake with the same peer is cancelled (newer wins,
    /// older state is dropped and zeroized). Refused while the peer is in
    /// backoff or already has an established session.
    pub fn initiate(&self, peer: PeerId, now: Instant) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();

        if let Some(backoff) = inner.backoff.get(&peer) {
            if now < backoff.until {
                return Err(Error::Backpressure(format!(
                    "handshake backoff active for {}",
                    peer
                )));
            }
        }
        if let Some(session) = inner.sessions.get(&peer) {
            if session.phase == SessionPhase::Established {
                return Err(Error::InvalidState("session already established".to_string()));
            }
        }

        let mut noise = NoiseSession::new_initiator(&self.identity.noise_keypair)?;
        let msg1 = noise.write_handshake_message()?;

        inner
            .sessions
            .insert(peer, PeerSession::new(noise, SessionPhase::AwaitResp, now));
        inner.stats.handshakes_started += 1;
        Ok(msg1)
    }

    /// Handle an inbound msg1. Returns msg2 bytes, or `None` when the
    /// message is discarded by the concurrent-initiation tie-break.
    pub fn on_handshake_init(
        &self,
        peer: PeerId,
        message: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.sessions.get(&peer) {
            match existing.phase {
                // Both sides initiated: the smaller peer id is the
                // initiator. If that is us, their msg1 is discarded; they
                // will accept ours by the same rule.
                SessionPhase::AwaitResp => {
                    if self.local_peer_id() < peer {
                        return Ok(None);
                    }
                }
                // Re-keyed or restarted peer; their fresh msg1 supersedes
                // whatever we had.
                _ => {}
            }
        }

        let mut noise = NoiseSession::new_responder(&self.identity.noise_keypair)?;
        if let Err(e) = noise.read_handshake_message(message) {
            drop(inner);
            self.fail_handshake(peer, now);
            return Err(e.into());
        }
        let msg2 = match noise.write_handshake_message() {
            Ok(msg2) => msg2,
            Err(e) => {
                drop(inner);
                self.fail_handshake(peer, now);
                return Err(e.into());
            }
        };

        inner
            .sessions
            .insert(peer, PeerSession::new(noise, SessionPhase::AwaitFinal, now));
        Ok(Some(msg2))
    }

    /// Handle an inbound msg2 (initiator side). Returns msg3 bytes; the
    /// session is Established afterwards.
    pub fn on_handshake_resp(&self, peer: PeerId, message: &[u8], now: Instant) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();

        let session = match inner.sessions.get_mut(&peer) {
            Some(session) if session.phase == SessionPhase::AwaitResp => session,
            _ => return Err(Error::InvalidState("no pending initiation".to_string())),
        };

        let result = session
            .noise
            .read_handshake_message(message)
            .map_err(Error::from)
            .and_then(|_| Self::check_remote_identity(&session.noise, peer))
            .and_then(|_| session.noise.write_handshake_message().map_err(Error::from));

        match result {
            Ok(msg3) => {
                session.phase = SessionPhase::Established;
                session.established_at = Some(now);
                session.last_progress = now;
                session.last_activity = now;
                inner.stats.handshakes_completed += 1;
                inner.backoff.remove(&peer);
                Ok(msg3)
            }
            Err(e) => {
                drop(inner);
                self.fail_handshake(peer, now);
                Err(e)
            }
        }
    }

    /// Handle an inbound msg3 (responder side); the session is Established
    /// afterwards.
    pub fn on_handshake_final(&self, peer: PeerId, message: &[u8], now: Instant) -> Result<()> {
        let mut inner = self.inner.lock();

        let session = match inner.sessions.get_mut(&peer) {
            Some(session) if session.phase == SessionPhase::AwaitFinal => session,
            _ => return Err(Error::InvalidState("no pending response".to_string())),
        };

        let result = session
            .noise
            .read_handshake_message(message)
            .map_err(Error::from)
            .and_then(|_| Self::check_remote_identity(&session.noise, peer));

        match result {
            Ok(()) => {
                session.phase = SessionPhase::Established;
                session.established_at = Some(now);
                session.last_progress = now;
                session.last_activity = now;
                inner.stats.handshakes_completed += 1;
                inner.backoff.remove(&peer);
                Ok(())
            }
            Err(e) => {
                drop(inner);
                self.fail_handshake(peer, now);
                Err(e)
            }
        }
    }

    /// Validate the authenticated remote static key and its binding to the
    /// claimed wire peer id.
    fn check_remote_identity(noise: &NoiseSession, peer: PeerId) -> Result<()> {
        let remote_static = noise
            .remote_static()
            .ok_or_else(|| Error::Crypto("handshake delivered no static key".to_string()))?;
        validation::validate_remote_static(&remote_static)?;

        if PeerId::from_public_key(&remote_static) != peer {
            return Err(Error::InvalidPublicKey(
                "peer id does not match static key".to_string(),
            ));
        }
        Ok(())
    }

    /// Encrypt plaintext for an established session
    pub fn encrypt(&self, peer: PeerId, plaintext: &[u8], now: Instant) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();

        let session = inner
            .sessions
            .get_mut(&peer)
            .filter(|session| session.phase == SessionPhase::Established)
            .ok_or(Error::SessionNotFound)?;

        let ciphertext = session.noise.encrypt(plaintext)?;
        session.last_activity = now;
        session.traffic_seen = true;
        session.sent_since_rekey += 1;

        if session.sent_since_rekey >= self.limits.rekey_messages {
            session.noise.rekey_outgoing()?;
            session.sent_since_rekey = 0;
            inner.stats.rekeys += 1;
        }
        Ok(ciphertext)
    }

    /// Decrypt ciphertext from an established session.
    ///
    /// Any failure tears the session down: a nonce mismatch means the
    /// transport ordering contract broke and the cipher state is
    /// unrecoverable.
    pub fn decrypt(&self, peer: PeerId, ciphertext: &[u8], now: Instant) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();

        let session = inner
            .sessions
            .get_mut(&peer)
            .filter(|session| session.phase == SessionPhase::Established)
            .ok_or(Error::SessionNotFound)?;

        match session.noise.decrypt(ciphertext) {
            Ok(plaintext) => {
                session.last_activity = now;
                session.traffic_seen = true;
                session.received_since_rekey += 1;
                if session.received_since_rekey >= self.limits.rekey_messages {
                    session.noise.rekey_incoming()?;
                    session.received_since_rekey = 0;
                    inner.stats.rekeys += 1;
                }
                Ok(plaintext)
            }
            Err(e) => {
                inner.sessions.remove(&peer);
                inner.stats.sessions_torn_down += 1;
                Err(Error::Crypto(format!("transport decrypt failed: {}", e)))
            }
        }
    }

    pub fn is_established(&self, peer: PeerId) -> bool {
        self.inner
            .lock()
            .sessions
            .get(&peer)
            .map(|session| session.phase == SessionPhase::Established)
            .unwrap_or(false)
    }

    pub fn phase(&self, peer: PeerId) -> Option<SessionPhase> {
        self.inner.lock().sessions.get(&peer).map(|s| s.phase)
    }

    /// Remote static key of an established session
    pub fn remote_static_of(&self, peer: PeerId) -> Option<[u8; 32]> {
        self.inner
            .lock()
            .sessions
            .get(&peer)
            .and_then(|session| session.noise.remote_static())
    }

    /// Fingerprint of the peer's authenticated static key
    pub fn fingerprint_of(&self, peer: PeerId) -> Option<Fingerprint> {
        self.remote_static_of(peer)
            .map(|key| Fingerprint::from_public_key(&key))
    }

    /// Whether a handshake may be started right now (no backoff pending)
    pub fn can_initiate(&self, peer: PeerId, now: Instant) -> bool {
        let inner = self.inner.lock();
        match inner.backoff.get(&peer) {
            Some(backoff) => now >= backoff.until,
            None => true,
        }
    }

    /// Tear down a session explicitly (Disconnect, Leave)
    pub fn close(&self, peer: PeerId) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.sessions.remove(&peer).is_some();
        if removed {
            inner.stats.sessions_torn_down += 1;
        }
        removed
    }

    /// Sweep stalled handshakes and expired sessions
    pub fn expire(&self, now: Instant) -> SessionSweep {
        let mut sweep = SessionSweep::default();
        let mut inner = self.inner.lock();
        let Inner {
            sessions, stats, ..
        } = &mut *inner;

        sessions.retain(|peer, session| match session.phase {
            SessionPhase::Established => {
                let established_at = session.established_at.unwrap_or(session.last_progress);
                // Used keys are refreshed by forcing a new handshake after
                // the rekey interval; idle sessions live to the session
                // timeout.
                let refresh_due =
                    session.traffic_seen && now.duration_since(established_at) > self.limits.rekey_interval;
                let idle_expired =
                    now.duration_since(session.last_activity) > self.limits.session_timeout;
                if refresh_due || idle_expired {
                    sweep.expired.push(*peer);
                    stats.sessions_torn_down += 1;
                    false
                } else {
                    true
                }
            }
            _ => {
                if now.duration_since(session.last_progress) > self.limits.handshake_timeout {
                    sweep.handshake_failed.push(*peer);
                    stats.handshakes_failed += 1;
                    false
                } else {
                    true
                }
            }
        });

        drop(inner);
        for peer in sweep.handshake_failed.clone() {
            self.engage_backoff(peer, now);
        }
        sweep
    }

    /// Zeroize and drop every session, handshake and backoff record
    pub fn panic_wipe(&self) {
        let mut inner = self.inner.lock();
        // NoiseSession drop zeroizes cipher and handshake keys via snow
        inner.sessions.clear();
        inner.backoff.clear();
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.lock().stats
    }

    pub fn established_peers(&self) -> Vec<PeerId> {
        self.inner
            .lock()
            .sessions
            .iter()
            .filter(|(_, session)| session.phase == SessionPhase::Established)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Record a handshake failure: drop state, engage exponential backoff
    fn fail_handshake(&self, peer: PeerId, now: Instant) {
        {
            let mut inner = self.inner.lock();
            inner.sessions.remove(&peer);
            inner.stats.handshakes_failed += 1;
        }
        self.engage_backoff(peer, now);
    }

    fn engage_backoff(&self, peer: PeerId, now: Instant) {
        let mut inner = self.inner.lock();
        let limits = &self.limits;
        let entry = inner.backoff.entry(peer).or_insert(Backoff {
            until: now,
            delay: limits.backoff_initial,
        });
        entry.until = now + entry.delay;
        entry.delay = (entry.delay * 2).min(limits.backoff_max);
    }
}
