//! BLE transport configuration
//!
//! Service and characteristic UUIDs, duty-cycle timing, and the rotating
//! advertisement token used to deter long-term MAC correlation.

use std::time::Duration;

use uuid::Uuid;

use crate::transport::{MAX_LINK_MTU, MIN_LINK_MTU};

/// Well-known mesh service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
/// Writable characteristic: inbound frames
pub const RX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
/// Notify characteristic: outbound frames
pub const TX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Outstanding writes allowed per link before the writer waits
pub const WRITE_CREDITS: usize = 4;

/// BLE adapter configuration
#[derive(Debug, Clone)]
pub struct BleTransportConfig {
    /// Upper bound accepted during MTU negotiation
    pub mtu_ceiling: usize,
    /// Reduced RF footprint: short scans, slow announce cadence
    pub low_visibility: bool,
    /// Scan window in normal operation
    pub scan_window: Duration,
    /// Pause between scan windows in normal operation
    pub scan_idle: Duration,
    /// Scan window in low-visibility mode
    pub low_vis_scan_window: Duration,
    /// Pause between scan windows in low-visibility mode
    pub low_vis_scan_idle: Duration,
    /// How often the advertisement token rotates
    pub token_rotation: Duration,
    /// Outstanding writes per link
    pub write_credits: usize,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            mtu_ceiling: MAX_LINK_MTU,
            low_visibility: false,
            scan_window: Duration::from_secs(10),
            scan_idle: Duration::from_secs(2),
            low_vis_scan_window: Duration::from_secs(2),
            low_vis_scan_idle: Duration::from_secs(30),
            token_rotation: Duration::from_secs(900),
            write_credits: WRITE_CREDITS,
        }
    }
}

impl BleTransportConfig {
    pub fn builder() -> BleConfigBuilder {
        BleConfigBuilder::default()
    }

    /// Clamp a negotiated value into the supported MTU range
    pub fn clamp_mtu(&self, negotiated: usize) -> usize {
        negotiated.clamp(MIN_LINK_MTU, self.mtu_ceiling.min(MAX_LINK_MTU))
    }

    /// Effective scan duty cycle for the current visibility mode
    pub fn scan_cycle(&self) -> (Duration, Duration) {
        if self.low_visibility {
            (self.low_vis_scan_window, self.low_vis_scan_idle)
        } else {
            (self.scan_window, self.scan_idle)
        }
    }
}

/// Builder for [`BleTransportConfig`]
#[derive(Debug, Default)]
pub struct BleConfigBuilder {
    config: Option<BleTransportConfig>,
}

impl BleConfigBuilder {
    fn config(&mut self) -> &mut BleTransportConfig {
        self.config.get_or_insert_with(BleTransportConfig::default)
    }

    pub fn mtu_ceiling(mut self, mtu: usize) -> Self {
        self.config().mtu_ceiling = mtu.clamp(MIN_LINK_MTU, MAX_LINK_MTU);
        self
    }

    pub fn low_visibility(mut self, enabled: bool) -> Self {
        self.config().low_visibility = enabled;
        self
    }

    pub fn token_rotation(mut self, interval: Duration) -> Self {
        self.config().token_rotation = interval;
        self
    }

    pub fn write_credits(mut self, credits: usize) -> Self {
        self.config().write_credits = credits.max(1);
        self
    }

    pub fn build(mut self) -> BleTransportConfig {
        self.config.take().unwrap_or_default()
    }
}

/// Rotating 4-byte ephemeral token carried in the advertisement payload.
///
/// Fresh randomness on every rotation; no linkage between consecutive
/// tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingToken(pub [u8; 4]);

impl AdvertisingToken {
    pub fn random() -> Self {
        let mut token = [0u8; 4];
        getrandom::getrandom(&mut token).expect("OS randomness unavailable");
        Self(token)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DEFAULT_LINK_MTU;

    #[test]
    fn test_mtu_clamping() {
        let config = BleTransportConfig::default();
        assert_eq!(config.clamp_mtu(10), MIN_LINK_MTU);
        assert_eq!(config.clamp_mtu(2000), MAX_LINK_MTU);
        assert_eq!(config.clamp_mtu(DEFAULT_LINK_MTU), DEFAULT_LINK_MTU);

        let config = BleTransportConfig::builder().mtu_ceiling(185).build();
        assert_eq!(config.clamp_mtu(512), 185);
    }

    #[test]
    fn test_low_visibility_duty_cycle() {
        let config = BleTransportConfig::builder().low_visibility(true).build();
        let (window, idle) = config.scan_cycle();
        assert_eq!(window, Duration::from_secs(2));
        assert_eq!(idle, Duration::from_secs(30));
    }

    #[test]
    fn test_token_rotation_produces_fresh_tokens() {
        let a = AdvertisingToken::random();
        let b = AdvertisingToken::random();
        // 4 bytes can collide, but not repeatedly
        let c = AdvertisingToken::random();
        assert!(a != b || b != c);
    }
}
