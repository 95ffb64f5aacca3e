//! BitChat - A decentralized, peer-to-peer messaging protocol
//!
//! This library implements the BitChat protocol engine: the binary wire
//! format, Bluetooth LE mesh routing with store-and-forward, payload
//! fragmentation, Noise XX secure sessions, and duplicate suppression.

pub mod app;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod mesh;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use app::{BitchatApp, Command, Event};
pub use config::BitchatConfig;
pub use error::{Error, Result};
pub use protocol::{BitchatPacket, Fingerprint, MessageId, PeerId};
