//! Persistence provider interfaces
//!
//! The core persists exactly two things, both through traits the platform
//! implements: the node's long-term key pair (platform key store) and
//! per-peer fingerprint trust labels (opaque key-value store). No message
//! content ever touches either.

use std::collections::HashMap;

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::crypto::BitchatIdentity;
use crate::error::Result;
use crate::protocol::Fingerprint;

/// Storage for the node's long-term static keys.
///
/// Implementations are expected to be backed by the platform keychain;
/// the core only ever sees raw key bytes transiently.
pub trait IdentityStore: Send + Sync {
    /// Load the stored (noise, signing) private keys, if any
    fn load(&self) -> Result<Option<([u8; 32], [u8; 32])>>;

    /// Persist the (noise, signing) private keys
    fn store(&self, noise_private: &[u8; 32], signing_private: &[u8; 32]) -> Result<()>;

    /// Destroy the stored keys
    fn wipe(&self) -> Result<()>;
}

/// Trust labels keyed by fingerprint (verified / blocked / petnames)
pub trait TrustStore: Send + Sync {
    fn label(&self, fingerprint: &Fingerprint) -> Option<String>;
    fn set_label(&self, fingerprint: Fingerprint, label: String);
    fn remove(&self, fingerprint: &Fingerprint);
}

/// Load the node identity from a store, generating and persisting a fresh
/// one on first run.
pub fn load_or_generate(store: &dyn IdentityStore) -> Result<BitchatIdentity> {
    if let Some((noise, signing)) = store.load()? {
        let noise = Zeroizing::new(noise);
        let signing = Zeroizing::new(signing);
        return Ok(BitchatIdentity::from_keys(*noise, *signing));
    }

    let identity = BitchatIdentity::generate();
    store.store(
        &identity.noise_keypair.private_bytes(),
        &identity.signing_keypair.private_bytes(),
    )?;
    Ok(identity)
}

/// In-memory identity store for tests and ephemeral nodes
#[derive(Default)]
pub struct MemoryIdentityStore {
    keys: Mutex<Option<(Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>)>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<([u8; 32], [u8; 32])>> {
        Ok(self
            .keys
            .lock()
            .as_ref()
            .map(|(noise, signing)| (**noise, **signing)))
    }

    fn store(&self, noise_private: &[u8; 32], signing_private: &[u8; 32]) -> Result<()> {
        *self.keys.lock() = Some((
            Zeroizing::new(*noise_private),
            Zeroizing::new(*signing_private),
        ));
        Ok(())
    }

    fn wipe(&self) -> Result<()> {
        *self.keys.lock() = None;
        Ok(())
    }
}

/// In-memory trust store for tests and ephemeral nodes
#[derive(Default)]
pub struct MemoryTrustStore {
    labels: Mutex<HashMap<Fingerprint, String>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn label(&self, fingerprint: &Fingerprint) -> Option<String> {
        self.labels.lock().get(fingerprint).cloned()
    }

    fn set_label(&self, fingerprint: Fingerprint, label: String) {
        self.labels.lock().insert(fingerprint, label);
    }

    fn remove(&self, fingerprint: &Fingerprint) {
        self.labels.lock().remove(fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_persists_across_loads() {
        let store = MemoryIdentityStore::new();
        let first = load_or_generate(&store).unwrap();
        let second = load_or_generate(&store).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_wipe_forces_fresh_identity() {
        let store = MemoryIdentityStore::new();
        let first = load_or_generate(&store).unwrap();
        store.wipe().unwrap();
        let second = load_or_generate(&store).unwrap();
        assert_ne!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn test_trust_labels() {
        let store = MemoryTrustStore::new();
        let fingerprint = Fingerprint([7; 32]);

        assert!(store.label(&fingerprint).is_none());
        store.set_label(fingerprint, "verified".to_string());
        assert_eq!(store.label(&fingerprint).as_deref(), Some("verified"));
        store.remove(&fingerprint);
        assert!(store.label(&fingerprint).is_none());
    }
}
