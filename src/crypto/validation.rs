// src/crypto/validation.rs
//! Remote static key validation
//!
//! Inbound Curve25519 public keys are checked against the all-zero key and
//! the known low-order points before a handshake result is trusted. Both
//! checks run in constant time over the full 32 bytes: the all-zero check
//! OR-accumulates, the blacklist check XOR-accumulates against each entry.

use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

/// The documented small-order points on Curve25519.
///
/// Contributory-behavior blacklist: the neutral element, the points of
/// order 2, 4 and 8, and their images under the +p / +2p encodings.
const LOW_ORDER_POINTS: [[u8; 32]; 7] = [
    // 0 (order 4)
    [
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ],
    // 1 (order 1, the neutral element)
    [
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00,
    ],
    // 325606250916557431795983626356110631294008115727848805560023387167927233504 (order 8)
    [
        0xe0, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f, 0xc4,
        0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16, 0x5f, 0x49,
        0xb8, 0x00,
    ],
    // 39382357235489614581723060781553021112529911719440698176882885853963445705823 (order 8)
    [
        0x5f, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83, 0xef,
        0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd, 0xd0, 0x9f,
        0x11, 0x57,
    ],
    // p - 1 (order 2)
    [
        0xec, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p (= 0, order 4)
    [
        0xed, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    // p + 1 (= 1, order 1)
    [
        0xee, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
];

/// Constant-time all-zero check: OR-accumulate every byte
pub fn is_all_zero(key: &[u8; 32]) -> bool {
    let mut acc = 0u8;
    for &byte in key {
        acc |= byte;
    }
    acc.ct_eq(&0u8).into()
}

/// Constant-time membership test against the low-order point set.
///
/// Each candidate is compared by XOR-accumulating over all 32 bytes; the
/// per-point results are OR-combined so the scan always touches every
/// entry.
pub fn is_low_order_point(key: &[u8; 32]) -> bool {
    let mut matched = 0u8;
    for point in &LOW_ORDER_POINTS {
        let mut diff = 0u8;
        for (a, b) in key.iter().zip(point.iter()) {
            diff |= a ^ b;
        }
        matched |= diff.ct_eq(&0u8).unwrap_u8();
    }
    matched != 0
}

/// Validate a remote static public key before trusting a handshake
pub fn validate_remote_static(key: &[u8; 32]) -> Result<()> {
    if is_all_zero(key) {
        return Err(Error::InvalidPublicKey("all-zero public key".to_string()));
    }
    if is_low_order_point(key) {
        return Err(Error::InvalidPublicKey(
            "low-order public key".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NoiseKeyPair;

    #[test]
    fn test_all_zero_rejected() {
        assert!(is_all_zero(&[0u8; 32]));
        assert!(validate_remote_static(&[0u8; 32]).is_err());

        let mut nearly = [0u8; 32];
        nearly[31] = 1;
        assert!(!is_all_zero(&nearly));
    }

    #[test]
    fn test_every_blacklist_entry_rejected() {
        for point in &LOW_ORDER_POINTS {
            assert!(is_low_order_point(point));
            assert!(validate_remote_static(point).is_err());
        }
    }

    #[test]
    fn test_honest_key_accepted() {
        let keypair = NoiseKeyPair::generate();
        validate_remote_static(&keypair.public_bytes()).unwrap();
    }

    #[test]
    fn test_near_miss_accepted() {
        let mut point = LOW_ORDER_POINTS[2];
        point[0] ^= 0x01;
        assert!(!is_low_order_point(&point));
    }
}
