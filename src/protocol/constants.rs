// src/protocol/constants.rs
use std::time::Duration;

pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header prefix: version(1) type(1) ttl(1) flags(1) timestamp(8)
/// sender_id(8) message_id(16)
pub const HEADER_SIZE: usize = 35;
pub const MAX_TTL: u8 = 7;
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + PEER_ID_SIZE + 4 + MAX_PAYLOAD_SIZE + SIGNATURE_SIZE;

pub const PEER_ID_SIZE: usize = 8;
pub const MESSAGE_ID_SIZE: usize = 16;
pub const FINGERPRINT_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

// Packet type constants
pub const PACKET_TYPE_ANNOUNCE: u8 = 0x01;
pub const PACKET_TYPE_MESSAGE: u8 = 0x02;
pub const PACKET_TYPE_FRAGMENT: u8 = 0x03;
pub const PACKET_TYPE_ACK: u8 = 0x04;
pub const PACKET_TYPE_LEAVE: u8 = 0x05;
pub const PACKET_TYPE_NOISE_HANDSHAKE_INIT: u8 = 0x10;
pub const PACKET_TYPE_NOISE_HANDSHAKE_RESP: u8 = 0x11;
pub const PACKET_TYPE_NOISE_HANDSHAKE_FINAL: u8 = 0x12;
pub const PACKET_TYPE_NOISE_TRANSPORT: u8 = 0x13;

// Flag bit positions
pub const FLAG_RECIPIENT_PRESENT: u8 = 0x01; // Bit 0
pub const FLAG_SIGNATURE_PRESENT: u8 = 0x02; // Bit 1
pub const FLAG_PAYLOAD_COMPRESSED: u8 = 0x04; // Bit 2
pub const FLAG_EXTENDED_LENGTH: u8 = 0x08; // Bit 3
pub const FLAG_KNOWN_MASK: u8 = 0x0F; // Bits 4-7 reserved

// Message payload TLV limits
pub const MAX_NICKNAME_LEN: usize = 64;
pub const MAX_CONTENT_LEN: usize = 65535;
pub const MAX_CHANNEL_LEN: usize = 64;
pub const MAX_MENTIONS: usize = 100;
pub const MAX_MENTION_LEN: usize = 64;

// Compression heuristics
pub const COMPRESSION_MIN_SIZE: usize = 100;
pub const ENTROPY_SAMPLE_SIZE: usize = 1024;
pub const ENTROPY_SKIP_THRESHOLD: f64 = 7.5;

// Fragmentation
pub const MAX_FRAGMENTS: usize = 64;
pub const FRAGMENT_HEADER_SIZE: usize = MESSAGE_ID_SIZE + 2 + 2;
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

// Deduplication
pub const SEEN_CAPACITY: usize = 4096;
pub const BLOOM_EXPECTED_ITEMS: usize = 16384;
pub const BLOOM_BITS: usize = 157_056;
pub const BLOOM_HASHES: usize = 7;
pub const SALT_EPOCH_SECS: u64 = 3600;
pub const SALT_OVERLAP_SECS: u64 = 900;

// Sessions
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(24 * 3600);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const REKEY_MESSAGES: u64 = 1_000_000;
pub const REKEY_INTERVAL: Duration = Duration::from_secs(3600);
pub const HANDSHAKE_BACKOFF_INITIAL: Duration = Duration::from_secs(5);
pub const HANDSHAKE_BACKOFF_MAX: Duration = Duration::from_secs(300);

// Peer registry
pub const PEER_TIMEOUT: Duration = Duration::from_secs(90);
pub const EVICTION_GRACE: Duration = Duration::from_secs(30);
pub const MAX_PEERS: usize = 256;

// Mesh routing
pub const TARGET_FANOUT: usize = 3;
pub const RELAY_JITTER_MS: u64 = 200;
pub const MAX_RELAY_PPS: u32 = 50;
pub const REPLAY_WINDOW_MS: u64 = 30_000;

// Store-and-forward
pub const OFFLINE_QUEUE_PER_RECIPIENT: usize = 64;
pub const OFFLINE_QUEUE_TOTAL: usize = 1024;
