//! Cryptographic identity for BitChat
//!
//! This module provides the key material every node carries:
//! - X25519 static keypair for Noise sessions
//! - Ed25519 keypair for packet signatures
//! - Peer-id / fingerprint derivation from the static public key
//! - Remote static key validation (low-order point rejection)

pub mod validation;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::protocol::binary::BinaryProtocol;
use crate::protocol::{BitchatPacket, Fingerprint, PeerId, SIGNATURE_SIZE};

/// X25519 static keypair backing Noise sessions
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NoiseKeyPair {
    private: [u8; 32],
    public: [u8; 32],
}

impl NoiseKeyPair {
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        getrandom::getrandom(&mut private).expect("OS randomness unavailable");
        Self::from_bytes(private)
    }

    pub fn from_bytes(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret).to_bytes();
        Self { private, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.private
    }
}

impl std::fmt::Debug for NoiseKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseKeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Ed25519 keypair for packet signatures
#[derive(Debug, Clone)]
pub struct SigningKeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        getrandom::getrandom(&mut secret).expect("OS randomness unavailable");
        let pair = Self::from_bytes(secret);
        secret.zeroize();
        pair
    }

    pub fn from_bytes(private: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&private);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// Combined node identity.
///
/// The wire peer id and the fingerprint both derive from the Noise static
/// public key; the signing key is distributed alongside it in Announce
/// beacons.
#[derive(Debug, Clone)]
pub struct BitchatIdentity {
    pub noise_keypair: NoiseKeyPair,
    pub signing_keypair: SigningKeyPair,
}

impl BitchatIdentity {
    pub fn generate() -> Self {
        Self {
            noise_keypair: NoiseKeyPair::generate(),
            signing_keypair: SigningKeyPair::generate(),
        }
    }

    pub fn from_keys(noise_private: [u8; 32], signing_private: [u8; 32]) -> Self {
        Self {
            noise_keypair: NoiseKeyPair::from_bytes(noise_private),
            signing_keypair: SigningKeyPair::from_bytes(signing_private),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.noise_keypair.public_bytes())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_public_key(&self.noise_keypair.public_bytes())
    }

    /// Sign a packet in place over its canonical signing bytes
    pub fn sign_packet(&self, packet: &mut BitchatPacket) {
        let bytes = BinaryProtocol::signing_bytes(packet);
        let signature = self.signing_keypair.sign(&bytes);
        packet.signature = Some(signature.to_bytes());
    }
}

/// Verify a packet signature against a known Ed25519 public key.
///
/// A packet without a signature fails verification; callers decide whether
/// unsigned packets are acceptable for the type in question.
pub fn verify_packet(packet: &BitchatPacket, signing_key: &[u8; 32]) -> Result<()> {
    let signature_bytes: &[u8; SIGNATURE_SIZE] = packet
        .signature
        .as_ref()
        .ok_or_else(|| Error::InvalidSignature("missing signature".to_string()))?;

    let verifying_key = VerifyingKey::from_bytes(signing_key)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    let signature = Signature::from_bytes(signature_bytes);

    verifying_key
        .verify(&BinaryProtocol::signing_bytes(packet), &signature)
        .map_err(|e| Error::InvalidSignature(e.to_string()))
}
