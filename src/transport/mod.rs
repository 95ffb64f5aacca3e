//! Transport layer for the BitChat mesh
//!
//! This module implements the link layer under the router:
//! - A minimal transport trait (send / events / mtu)
//! - Bluetooth LE adapter (central + peripheral roles) behind the
//!   `bluetooth` feature
//! - An in-process transport with explicit topology for tests and
//!   simulations
//! - Bounded per-link write queues with credit-based flow control

pub mod ble_config;
pub mod bounded_queue;
pub mod memory;
pub mod traits;

#[cfg(feature = "bluetooth")]
pub mod ble;

use serde::{Deserialize, Serialize};

use crate::protocol::PeerId;

pub use ble_config::{AdvertisingToken, BleConfigBuilder, BleTransportConfig};
pub use bounded_queue::{BoundedQueue, OverflowBehavior, QueueConfig, QueueStats};
pub use memory::{MemoryHub, MemoryTransport};
pub use traits::Transport;

/// Smallest data payload any BLE link must support
pub const MIN_LINK_MTU: usize = 23;
/// Negotiation target for modern stacks
pub const DEFAULT_LINK_MTU: usize = 247;
/// Upper bound we ever request
pub const MAX_LINK_MTU: usize = 512;

/// Events emitted by a transport towards the router
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A link to a peer came up (or was identified)
    Connected { peer_id: PeerId, handle: String },
    /// The link dropped
    Disconnected { peer_id: PeerId, reason: String },
    /// A complete frame arrived from a linked peer
    FrameReceived { peer_id: PeerId, frame: Vec<u8> },
    /// Link-level failure worth surfacing
    Error {
        peer_id: Option<PeerId>,
        message: String,
    },
}

/// Power-state hint consumed by the router's duty cycling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PowerMode {
    Performance,
    #[default]
    Balanced,
    PowerSaver,
    UltraLow,
}

impl std::str::FromStr for PowerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "performance" => Ok(Self::Performance),
            "balanced" => Ok(Self::Balanced),
            "powersaver" | "power-saver" => Ok(Self::PowerSaver),
            "ultralow" | "ultra-low" => Ok(Self::UltraLow),
            other => Err(format!("unknown power mode: {}", other)),
        }
    }
}

/// Transport counters for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    pub link_count: usize,
}
