//! Wire protocol for BitChat
//!
//! This module implements the core binary protocol for the BitChat mesh:
//! - Fixed-header packet format with flag-driven optional fields
//! - TLV (Type-Length-Value) encoding for message payloads
//! - LZ4 compression for bandwidth efficiency
//! - Payload fragmentation for MTU-constrained links
//! - Mesh routing metadata (TTL, sender/recipient addressing)

pub mod binary;
pub mod compression;
pub mod constants;
pub mod error;
pub mod fragment;
pub mod tlv;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use constants::*;
pub use error::{DecodeError, DecodeResult};

/// Peer identifier: the first 8 bytes of the SHA-256 of the peer's
/// long-term static public key. Stable across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; PEER_ID_SIZE]);

impl PeerId {
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut id = [0u8; PEER_ID_SIZE];
        id.copy_from_slice(&digest[..PEER_ID_SIZE]);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Message identifier: 16 random bytes, globally unique with overwhelming
/// probability. Dedup and reassembly key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; MESSAGE_ID_SIZE]);

impl MessageId {
    pub fn random() -> Self {
        let mut id = [0u8; MESSAGE_ID_SIZE];
        getrandom::getrandom(&mut id).expect("OS randomness unavailable");
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Full SHA-256 of a static public key, used for out-of-band verification
/// and trust labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(Sha256::digest(public_key).into())
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// Truncated wire identifier derived from the same key
    pub fn peer_id(&self) -> PeerId {
        let mut id = [0u8; PEER_ID_SIZE];
        id.copy_from_slice(&self.0[..PEER_ID_SIZE]);
        PeerId(id)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Packet types on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// Periodic presence beacon carrying identity keys and a nickname hint
    Announce = PACKET_TYPE_ANNOUNCE,
    /// Chat content, plaintext when broadcast
    Message = PACKET_TYPE_MESSAGE,
    /// Fragment envelope for oversize payloads
    Fragment = PACKET_TYPE_FRAGMENT,
    /// Delivery acknowledgment; payload is the acked message id
    Ack = PACKET_TYPE_ACK,
    /// Graceful disconnect notification
    Leave = PACKET_TYPE_LEAVE,
    /// First Noise XX handshake message {e}
    NoiseHandshakeInit = PACKET_TYPE_NOISE_HANDSHAKE_INIT,
    /// Second Noise XX handshake message {e, ee, s, es}
    NoiseHandshakeResp = PACKET_TYPE_NOISE_HANDSHAKE_RESP,
    /// Third Noise XX handshake message {s, se}
    NoiseHandshakeFinal = PACKET_TYPE_NOISE_HANDSHAKE_FINAL,
    /// Encrypted transport envelope wrapping an inner packet
    NoiseTransport = PACKET_TYPE_NOISE_TRANSPORT,
}

impl PacketType {
    pub fn from_u8(value: u8) -> DecodeResult<Self> {
        match value {
            PACKET_TYPE_ANNOUNCE => Ok(Self::Announce),
            PACKET_TYPE_MESSAGE => Ok(Self::Message),
            PACKET_TYPE_FRAGMENT => Ok(Self::Fragment),
            PACKET_TYPE_ACK => Ok(Self::Ack),
            PACKET_TYPE_LEAVE => Ok(Self::Leave),
            PACKET_TYPE_NOISE_HANDSHAKE_INIT => Ok(Self::NoiseHandshakeInit),
            PACKET_TYPE_NOISE_HANDSHAKE_RESP => Ok(Self::NoiseHandshakeResp),
            PACKET_TYPE_NOISE_HANDSHAKE_FINAL => Ok(Self::NoiseHandshakeFinal),
            PACKET_TYPE_NOISE_TRANSPORT => Ok(Self::NoiseTransport),
            other => Err(DecodeError::UnknownType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// The three handshake steps, which consume differently in the router
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::NoiseHandshakeInit | Self::NoiseHandshakeResp | Self::NoiseHandshakeFinal
        )
    }
}

/// A BitChat packet, the unit of transmission over any transport link.
///
/// `payload` always holds the uncompressed bytes; compression is applied
/// and stripped inside the codec. Immutable once signed except for the TTL
/// byte, which relays decrement (the signature excludes it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitchatPacket {
    pub version: u8,
    pub packet_type: PacketType,
    pub ttl: u8,
    pub timestamp_ms: u64,
    pub sender_id: PeerId,
    pub recipient_id: Option<PeerId>,
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl BitchatPacket {
    /// Create a broadcast packet (no recipient) with a fresh message id
    pub fn new_broadcast(packet_type: PacketType, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            ttl: MAX_TTL,
            timestamp_ms: unix_time_ms(),
            sender_id,
            recipient_id: None,
            message_id: MessageId::random(),
            payload,
            signature: None,
        }
    }

    /// Create a directed packet with a fresh message id
    pub fn new_direct(
        packet_type: PacketType,
        sender_id: PeerId,
        recipient_id: PeerId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            recipient_id: Some(recipient_id),
            ..Self::new_broadcast(packet_type, sender_id, payload)
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// Hops already traversed, assuming the originator set ttl = MAX_TTL
    pub fn hop_count(&self) -> u8 {
        MAX_TTL.saturating_sub(self.ttl)
    }

    pub fn decrement_ttl(&mut self) {
        self.ttl = self.ttl.saturating_sub(1);
    }
}

/// Milliseconds since the Unix epoch
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
