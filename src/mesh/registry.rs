//! Peer registry
//!
//! Tracks every peer the node knows about: transport handles, identity
//! keys learned from Announce beacons, Noise authentication state and
//! liveness. The registry is the only owner of peer records; the router
//! and the session manager refer to peers by id.

use std::collections::HashMap;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::{Fingerprint, PeerId, EVICTION_GRACE, MAX_PEERS, PEER_TIMEOUT};

/// Peer liveness lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Seen in an advertisement or announce, no live link yet
    Discovered,
    /// Transport link is up
    Connected,
    /// Noise handshake completed on this link
    Authenticated,
    /// No traffic for [`PEER_TIMEOUT`]; evicted after [`EVICTION_GRACE`]
    Stale,
}

/// A tracked peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub state: PeerState,
    pub fingerprint: Option<Fingerprint>,
    pub static_public_key: Option<[u8; 32]>,
    pub signing_key: Option<[u8; 32]>,
    /// Untrusted display hint from the peer's announce
    pub nickname: Option<String>,
    /// Most recently active transport handle
    pub handle: Option<String>,
    /// Older handles kept for fallback after reconnects
    pub secondary_handles: Vec<String>,
    pub last_seen: Instant,
    pub rssi: Option<i16>,
    pub battery_hint: Option<u8>,
    /// Set while a transport link exists, survives Stale transitions
    link_up: bool,
    /// Noise handshake has completed at least once on the current link
    authenticated: bool,
}

impl PeerRecord {
    fn new(peer_id: PeerId, now: Instant) -> Self {
        Self {
            peer_id,
            state: PeerState::Discovered,
            fingerprint: None,
            static_public_key: None,
            signing_key: None,
            nickname: None,
            handle: None,
            secondary_handles: Vec::new(),
            last_seen: now,
            rssi: None,
            battery_hint: None,
            link_up: false,
            authenticated: false,
        }
    }

    fn revived_state(&self) -> PeerState {
        if self.authenticated && self.link_up {
            PeerState::Authenticated
        } else if self.link_up {
            PeerState::Connected
        } else {
            PeerState::Discovered
        }
    }
}

/// Registry change notifications, forwarded to the event bus by the mesh
/// service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRegistryEvent {
    PeerAdded { peer_id: PeerId },
    PeerAuthenticated { peer_id: PeerId, fingerprint: Fingerprint },
    PeerLost { peer_id: PeerId },
}

/// Registry of known peers, capped at [`MAX_PEERS`]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Record a peer seen via advertisement or announce. Returns
    /// `PeerAdded` the first time the peer appears.
    pub fn upsert_discovered(
        &mut self,
        peer_id: PeerId,
        handle: Option<String>,
        now: Instant,
    ) -> Option<PeerRegistryEvent> {
        let is_new = !self.peers.contains_key(&peer_id);
        if is_new {
            self.make_room(now);
            if self.peers.len() >= MAX_PEERS {
                return None; // full of authenticated peers; drop the newcomer
            }
            self.peers.insert(peer_id, PeerRecord::new(peer_id, now));
        }

        let record = self.peers.get_mut(&peer_id).expect("just inserted");
        record.last_seen = now;
        if let Some(handle) = handle {
            Self::promote_handle(record, handle);
        }

        is_new.then_some(PeerRegistryEvent::PeerAdded { peer_id })
    }

    /// A transport link to this peer came up
    pub fn mark_connected(
        &mut self,
        peer_id: PeerId,
        handle: Option<String>,
        now: Instant,
    ) -> Option<PeerRegistryEvent> {
        let added = self.upsert_discovered(peer_id, handle, now);
        if let Some(record) = self.peers.get_mut(&peer_id) {
            record.link_up = true;
            if record.state != PeerState::Authenticated {
                record.state = PeerState::Connected;
            }
        }
        added
    }

    /// The transport link dropped; liveness timing takes over from here
    pub fn mark_disconnected(&mut self, peer_id: PeerId) {
        if let Some(record) = self.peers.get_mut(&peer_id) {
            record.link_up = false;
            record.authenticated = false;
            if record.state != PeerState::Stale {
                record.state = PeerState::Discovered;
            }
        }
    }

    /// Store identity keys learned from a verified announce
    pub fn learn_identity(
        &mut self,
        peer_id: PeerId,
        static_public_key: [u8; 32],
        signing_key: [u8; 32],
        nickname: Option<String>,
        now: Instant,
    ) -> Result<Option<PeerRegistryEvent>> {
        let fingerprint = Fingerprint::from_public_key(&static_public_key);
        if fingerprint.peer_id() != peer_id {
            return Err(Error::InvalidPublicKey(
                "peer id does not match announced static key".to_string(),
            ));
        }

        let added = self.upsert_discovered(peer_id, None, now);
        let record = self
            .peers
            .get_mut(&peer_id)
            .ok_or_else(|| Error::ResourceExhausted("peer table full".to_string()))?;

        // A different static key under the same 8-byte id is a collision;
        // collisions are untrusted and rejected.
        if let Some(existing) = &record.static_public_key {
            if *existing != static_public_key {
                return Err(Error::InvalidPublicKey(
                    "peer id collision with distinct static keys".to_string(),
                ));
            }
        }

        record.fingerprint = Some(fingerprint);
        record.static_public_key = Some(static_public_key);
        record.signing_key = Some(signing_key);
        if nickname.is_some() {
            record.nickname = nickname;
        }
        record.last_seen = now;
        Ok(added)
    }

    /// The Noise handshake with this peer completed.
    ///
    /// The authenticated static key is the source of truth; it must agree
    /// with anything learned earlier.
    pub fn mark_authenticated(
        &mut self,
        peer_id: PeerId,
        static_public_key: [u8; 32],
        now: Instant,
    ) -> Result<PeerRegistryEvent> {
        let fingerprint = Fingerprint::from_public_key(&static_public_key);
        if fingerprint.peer_id() != peer_id {
            return Err(Error::InvalidPublicKey(
                "peer id does not match session static key".to_string(),
            ));
        }

        self.upsert_discovered(peer_id, None, now);
        let record = self
            .peers
            .get_mut(&peer_id)
            .ok_or_else(|| Error::ResourceExhausted("peer table full".to_string()))?;

        if let Some(existing) = &record.static_public_key {
            if *existing != static_public_key {
                return Err(Error::InvalidPublicKey(
                    "authenticated key disagrees with announced key".to_string(),
                ));
            }
        }

        record.static_public_key = Some(static_public_key);
        record.fingerprint = Some(fingerprint);
        record.state = PeerState::Authenticated;
        record.link_up = true;
        record.authenticated = true;
        record.last_seen = now;

        Ok(PeerRegistryEvent::PeerAuthenticated {
            peer_id,
            fingerprint,
        })
    }

    /// Refresh liveness on any received packet
    pub fn touch(&mut self, peer_id: PeerId, now: Instant) {
        if let Some(record) = self.peers.get_mut(&peer_id) {
            record.last_seen = now;
            if record.state == PeerState::Stale {
                record.state = record.revived_state();
            }
        }
    }

    pub fn update_link_quality(&mut self, peer_id: PeerId, rssi: Option<i16>, battery: Option<u8>) {
        if let Some(record) = self.peers.get_mut(&peer_id) {
            if rssi.is_some() {
                record.rssi = rssi;
            }
            if battery.is_some() {
                record.battery_hint = battery;
            }
        }
    }

    /// Liveness sweep: Connected/Authenticated peers without traffic for
    /// [`PEER_TIMEOUT`] turn Stale; Stale peers past the grace period are
    /// evicted.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<PeerRegistryEvent> {
        let mut events = Vec::new();

        for record in self.peers.values_mut() {
            if record.state != PeerState::Stale
                && now.duration_since(record.last_seen) > PEER_TIMEOUT
            {
                record.state = PeerState::Stale;
            }
        }

        let evict_after = PEER_TIMEOUT + EVICTION_GRACE;
        let doomed: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, record)| {
                record.state == PeerState::Stale
                    && now.duration_since(record.last_seen) > evict_after
            })
            .map(|(peer_id, _)| *peer_id)
            .collect();

        for peer_id in doomed {
            self.peers.remove(&peer_id);
            events.push(PeerRegistryEvent::PeerLost { peer_id });
        }
        events
    }

    /// Remove a peer outright (Leave packet or Disconnect command)
    pub fn remove(&mut self, peer_id: PeerId) -> Option<PeerRegistryEvent> {
        self.peers
            .remove(&peer_id)
            .map(|_| PeerRegistryEvent::PeerLost { peer_id })
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn signing_key_of(&self, peer_id: &PeerId) -> Option<[u8; 32]> {
        self.peers.get(peer_id).and_then(|record| record.signing_key)
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers
            .get(peer_id)
            .map(|record| {
                matches!(record.state, PeerState::Connected | PeerState::Authenticated)
            })
            .unwrap_or(false)
    }

    pub fn is_known(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Peers with a live link, eligible as relay targets
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, record)| {
                matches!(record.state, PeerState::Connected | PeerState::Authenticated)
            })
            .map(|(peer_id, _)| *peer_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop every record (emergency wipe)
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Newest handle wins; the previous primary is kept as fallback
    fn promote_handle(record: &mut PeerRecord, handle: String) {
        if record.handle.as_deref() == Some(handle.as_str()) {
            return;
        }
        if let Some(old) = record.handle.take() {
            record.secondary_handles.retain(|h| *h != old && *h != handle);
            record.secondary_handles.push(old);
            // Keep the fallback list short
            if record.secondary_handles.len() > 4 {
                record.secondary_handles.remove(0);
            }
        }
        record.handle = Some(handle);
    }

    /// Capacity enforcement: prefer evicting the oldest Stale peer, then
    /// the least recently active peer that never authenticated.
    fn make_room(&mut self, _now: Instant) {
        if self.peers.len() < MAX_PEERS {
            return;
        }

        let stale_victim = self
            .peers
            .values()
            .filter(|record| record.state == PeerState::Stale)
            .min_by_key(|record| record.last_seen)
            .map(|record| record.peer_id);

        let victim = stale_victim.or_else(|| {
            self.peers
                .values()
                .filter(|record| !record.authenticated)
                .min_by_key(|record| record.last_seen)
                .map(|record| record.peer_id)
        });

        if let Some(peer_id) = victim {
            self.peers.remove(&peer_id);
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NoiseKeyPair;
    use std::time::Duration;

    fn identity_keys() -> ([u8; 32], PeerId) {
        let keypair = NoiseKeyPair::generate();
        let public = keypair.public_bytes();
        (public, PeerId::from_public_key(&public))
    }

    #[test]
    fn test_lifecycle_discovered_to_authenticated() {
        let mut registry = PeerRegistry::new();
        let (static_key, peer_id) = identity_keys();
        let now = Instant::now();

        let event = registry.upsert_discovered(peer_id, Some("hci0/dev_A1".to_string()), now);
        assert_eq!(event, Some(PeerRegistryEvent::PeerAdded { peer_id }));
        assert_eq!(registry.get(&peer_id).unwrap().state, PeerState::Discovered);

        registry.mark_connected(peer_id, None, now);
        assert_eq!(registry.get(&peer_id).unwrap().state, PeerState::Connected);

        let event = registry.mark_authenticated(peer_id, static_key, now).unwrap();
        assert!(matches!(event, PeerRegistryEvent::PeerAuthenticated { .. }));
        assert_eq!(
            registry.get(&peer_id).unwrap().state,
            PeerState::Authenticated
        );
    }

    #[test]
    fn test_mismatched_peer_id_rejected() {
        let mut registry = PeerRegistry::new();
        let (static_key, _) = identity_keys();
        let wrong_id = PeerId::from_bytes([0xBB; 8]);
        let now = Instant::now();

        assert!(registry
            .mark_authenticated(wrong_id, static_key, now)
            .is_err());
    }

    #[test]
    fn test_peer_id_collision_rejected() {
        let mut registry = PeerRegistry::new();
        let (static_key, peer_id) = identity_keys();
        let now = Instant::now();

        registry
            .learn_identity(peer_id, static_key, [1; 32], None, now)
            .unwrap();

        // Same wire id, different static key
        let (other_key, _) = identity_keys();
        assert!(registry
            .learn_identity(peer_id, other_key, [1; 32], None, now)
            .is_err());
    }

    #[test]
    fn test_staleness_and_eviction() {
        let mut registry = PeerRegistry::new();
        let (static_key, peer_id) = identity_keys();
        let start = Instant::now();

        registry.mark_connected(peer_id, None, start);
        registry.mark_authenticated(peer_id, static_key, start).unwrap();

        // Past PEER_TIMEOUT: stale but present
        let t1 = start + PEER_TIMEOUT + Duration::from_secs(1);
        assert!(registry.evict_stale(t1).is_empty());
        assert_eq!(registry.get(&peer_id).unwrap().state, PeerState::Stale);

        // Traffic revives the peer
        registry.touch(peer_id, t1);
        assert_eq!(
            registry.get(&peer_id).unwrap().state,
            PeerState::Authenticated
        );

        // Silent past timeout + grace: evicted
        let t2 = t1 + PEER_TIMEOUT + EVICTION_GRACE + Duration::from_secs(1);
        let events = registry.evict_stale(t2);
        assert_eq!(events, vec![PeerRegistryEvent::PeerLost { peer_id }]);
        assert!(!registry.is_known(&peer_id));
    }

    #[test]
    fn test_handle_coalescing() {
        let mut registry = PeerRegistry::new();
        let peer_id = PeerId::from_bytes([1; 8]);
        let now = Instant::now();

        registry.upsert_discovered(peer_id, Some("dev_A".to_string()), now);
        registry.upsert_discovered(peer_id, Some("dev_B".to_string()), now);

        let record = registry.get(&peer_id).unwrap();
        assert_eq!(record.handle.as_deref(), Some("dev_B"));
        assert_eq!(record.secondary_handles, vec!["dev_A".to_string()]);
    }

    #[test]
    fn test_capacity_evicts_unauthenticated_first() {
        let mut registry = PeerRegistry::new();
        let start = Instant::now();

        for i in 0..MAX_PEERS {
            let mut bytes = [0u8; 8];
            bytes[..4].copy_from_slice(&(i as u32).to_be_bytes());
            registry.upsert_discovered(
                PeerId::from_bytes(bytes),
                None,
                start + Duration::from_millis(i as u64),
            );
        }
        assert_eq!(registry.len(), MAX_PEERS);

        // One more: the least recently active unauthenticated peer goes
        let newcomer = PeerId::from_bytes([0xFF; 8]);
        registry.upsert_discovered(newcomer, None, start + Duration::from_secs(10));
        assert_eq!(registry.len(), MAX_PEERS);
        assert!(registry.is_known(&newcomer));
        assert!(!registry.is_known(&PeerId::from_bytes([0, 0, 0, 0, 0, 0, 0, 0])));
    }

    #[test]
    fn test_clear_wipes_all() {
        let mut registry = PeerRegistry::new();
        registry.upsert_discovered(PeerId::from_bytes([1; 8]), None, Instant::now());
        registry.clear();
        assert!(registry.is_empty());
    }
}
