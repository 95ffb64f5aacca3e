//! Runtime configuration
//!
//! The environment knobs the core exposes: log filter, nickname,
//! low-visibility mode, power-state hint, the testing-only TTL override
//! and the BLE MTU ceiling. `from_env` follows the `BITCHAT_*` variable
//! convention.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{MAX_NICKNAME_LEN, MAX_TTL};
use crate::transport::{PowerMode, MAX_LINK_MTU, MIN_LINK_MTU};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitchatConfig {
    /// Display name carried in announce beacons (untrusted hint)
    pub nickname: String,
    /// tracing-subscriber EnvFilter directive for the binary
    pub log_filter: String,
    /// Reduced RF footprint: short scans, slow announce cadence
    pub low_visibility: bool,
    /// Power-state hint consumed by the router
    pub power_mode: PowerMode,
    /// TTL stamped on originated packets. Testing override only; the wire
    /// maximum stays [`MAX_TTL`].
    pub max_ttl: u8,
    /// Upper bound for BLE MTU negotiation
    pub mtu_ceiling: usize,
    /// Presence beacon cadence in normal visibility
    pub announce_interval: Duration,
}

impl Default for BitchatConfig {
    fn default() -> Self {
        Self {
            nickname: "anon".to_string(),
            log_filter: "info".to_string(),
            low_visibility: false,
            power_mode: PowerMode::default(),
            max_ttl: MAX_TTL,
            mtu_ceiling: MAX_LINK_MTU,
            announce_interval: Duration::from_secs(4),
        }
    }
}

impl BitchatConfig {
    /// Build configuration from `BITCHAT_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        use std::env;

        let mut config = Self::default();

        if let Ok(nickname) = env::var("BITCHAT_NICKNAME") {
            if !nickname.is_empty() && nickname.len() <= MAX_NICKNAME_LEN {
                config.nickname = nickname;
            }
        }

        if let Ok(filter) = env::var("BITCHAT_LOG") {
            config.log_filter = filter;
        }

        if let Ok(low_vis) = env::var("BITCHAT_LOW_VISIBILITY") {
            config.low_visibility = low_vis == "1" || low_vis.eq_ignore_ascii_case("true");
        }

        if let Ok(mode) = env::var("BITCHAT_POWER_MODE") {
            if let Ok(mode) = mode.parse() {
                config.power_mode = mode;
            }
        }

        if let Ok(ttl) = env::var("BITCHAT_MAX_TTL") {
            if let Ok(ttl) = ttl.parse::<u8>() {
                config.max_ttl = ttl.clamp(1, MAX_TTL);
            }
        }

        if let Ok(mtu) = env::var("BITCHAT_MTU_CEILING") {
            if let Ok(mtu) = mtu.parse::<usize>() {
                config.mtu_ceiling = mtu.clamp(MIN_LINK_MTU, MAX_LINK_MTU);
            }
        }

        if let Ok(secs) = env::var("BITCHAT_ANNOUNCE_INTERVAL") {
            if let Ok(secs) = secs.parse::<u64>() {
                config.announce_interval = Duration::from_secs(secs.max(1));
            }
        }

        config
    }
}
