//! Payload compression for network frames
//!
//! LZ4 with a size-prepended framing. Compression is skipped for payloads
//! below [`COMPRESSION_MIN_SIZE`] and for payloads whose sampled entropy
//! suggests already-compressed or random content, where LZ4 would only add
//! overhead.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use super::constants::{
    COMPRESSION_MIN_SIZE, ENTROPY_SAMPLE_SIZE, ENTROPY_SKIP_THRESHOLD, MAX_PAYLOAD_SIZE,
};
use super::error::{DecodeError, DecodeResult};

/// Compress a payload if it is likely to benefit.
///
/// Returns `Some(compressed)` only when the result is actually smaller than
/// the input; callers set the compression flag accordingly.
pub fn maybe_compress(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < COMPRESSION_MIN_SIZE {
        return None;
    }
    if sample_entropy(payload) > ENTROPY_SKIP_THRESHOLD {
        return None;
    }

    let compressed = compress_prepend_size(payload);
    if compressed.len() < payload.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Decompress a size-prepended LZ4 payload.
///
/// The embedded original size is validated against [`MAX_PAYLOAD_SIZE`]
/// before any allocation happens.
pub fn decompress(compressed: &[u8]) -> DecodeResult<Vec<u8>> {
    if compressed.len() < 4 {
        return Err(DecodeError::TooShort {
            expected: 4,
            actual: compressed.len(),
        });
    }

    let original_size =
        u32::from_le_bytes([compressed[0], compressed[1], compressed[2], compressed[3]]) as usize;
    if original_size > MAX_PAYLOAD_SIZE {
        return Err(DecodeError::FieldExceedsLimit {
            field: "decompressed payload",
            limit: MAX_PAYLOAD_SIZE,
            actual: original_size,
        });
    }

    decompress_size_prepended(compressed).map_err(|_| DecodeError::BadLengthField {
        field: "compressed payload",
        value: compressed.len(),
    })
}

/// Shannon entropy (bits per byte) over a bounded prefix of the payload.
fn sample_entropy(data: &[u8]) -> f64 {
    let sample = &data[..data.len().min(ENTROPY_SAMPLE_SIZE)];
    let mut freq = [0u64; 256];
    for &byte in sample {
        freq[byte as usize] += 1;
    }

    let len = sample.len() as f64;
    let mut entropy = 0.0;
    for &count in &freq {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }
    entropy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_not_compressed() {
        assert!(maybe_compress(b"hello").is_none());
    }

    #[test]
    fn test_compressible_roundtrip() {
        let payload = b"the mesh relays the mesh relays the mesh relays ".repeat(16);
        let compressed = maybe_compress(&payload).expect("repetitive payload should compress");
        assert!(compressed.len() < payload.len());

        let restored = decompress(&compressed).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_high_entropy_skipped() {
        let mut payload = vec![0u8; 4096];
        getrandom::getrandom(&mut payload).unwrap();
        assert!(maybe_compress(&payload).is_none());
    }

    #[test]
    fn test_oversize_claim_rejected() {
        // Well-formed prefix claiming a 2 MiB original
        let mut bogus = ((2 * 1024 * 1024) as u32).to_le_bytes().to_vec();
        bogus.extend_from_slice(&[0u8; 32]);
        assert!(matches!(
            decompress(&bogus),
            Err(DecodeError::FieldExceedsLimit { .. })
        ));
    }

    #[test]
    fn test_corrupt_stream_rejected() {
        let payload = b"some compressible payload, repeated and repeated".repeat(8);
        let mut compressed = maybe_compress(&payload).unwrap();
        let last = compressed.len() - 1;
        compressed.truncate(last);
        assert!(decompress(&compressed).is_err());
    }
}
