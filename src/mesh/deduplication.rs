//! Message deduplication with a salted Bloom filter and an exact LRU set
//!
//! The Bloom filter gives a fast authoritative "unseen" answer; a Bloom hit
//! falls through to the exact LRU cache, which is authoritative for "seen".
//! The filter salt is derived from the wall-clock hour and a per-node
//! secret, and rotates hourly; the previous filter keeps answering for a
//! 15-minute overlap so recently seen ids stay suppressed across the
//! rotation.

use std::num::NonZeroUsize;

use bitvec::prelude::*;
use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::protocol::{
    MessageId, BLOOM_BITS, BLOOM_HASHES, SALT_EPOCH_SECS, SALT_OVERLAP_SECS, SEEN_CAPACITY,
};

/// One epoch's Bloom filter
struct SaltedBloom {
    bits: BitVec,
    salt: [u8; 32],
    epoch: u64,
}

impl SaltedBloom {
    fn new(epoch: u64, local_secret: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(epoch.to_be_bytes());
        hasher.update(local_secret);
        Self {
            bits: bitvec![0; BLOOM_BITS],
            salt: hasher.finalize().into(),
            epoch,
        }
    }

    fn indices(&self, id: &MessageId) -> impl Iterator<Item = usize> + '_ {
        let id = *id;
        (0..BLOOM_HASHES as u32).map(move |seed| {
            let mut hasher = Sha256::new();
            hasher.update(self.salt);
            hasher.update(seed.to_le_bytes());
            hasher.update(id.as_bytes());
            let digest = hasher.finalize();
            let word = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
            (word % BLOOM_BITS as u64) as usize
        })
    }

    fn insert(&mut self, id: &MessageId) {
        let indices: Vec<usize> = self.indices(id).collect();
        for index in indices {
            self.bits.set(index, true);
        }
    }

    fn possibly_contains(&self, id: &MessageId) -> bool {
        self.indices(id).all(|index| self.bits[index])
    }
}

/// Deduplication counters for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupStats {
    pub checks: u64,
    pub duplicates: u64,
    pub bloom_fast_path: u64,
    pub rotations: u64,
}

/// Sliding-window duplicate suppression for packet message ids.
pub struct MessageDeduplicator {
    seen: LruCache<MessageId, ()>,
    current: SaltedBloom,
    previous: Option<SaltedBloom>,
    local_secret: [u8; 32],
    stats: DedupStats,
}

impl MessageDeduplicator {
    pub fn new() -> Self {
        let mut local_secret = [0u8; 32];
        getrandom::getrandom(&mut local_secret).expect("OS randomness unavailable");
        Self::with_secret(local_secret, 0)
    }

    pub fn with_secret(local_secret: [u8; 32], now_unix: u64) -> Self {
        Self {
            seen: LruCache::new(
                NonZeroUsize::new(SEEN_CAPACITY).expect("SEEN_CAPACITY must be non-zero"),
            ),
            current: SaltedBloom::new(now_unix / SALT_EPOCH_SECS, &local_secret),
            previous: None,
            local_secret,
            stats: DedupStats::default(),
        }
    }

    /// Whether this id is new. Side-effectful: a `true` answer records the
    /// id, so asking twice about the same id yields `true` then `false`.
    pub fn should_process(&mut self, id: MessageId, now_unix: u64) -> bool {
        self.rotate_if_needed(now_unix);
        self.stats.checks += 1;

        let maybe_seen = self.current.possibly_contains(&id)
            || self
                .previous
                .as_ref()
                .map(|bloom| bloom.possibly_contains(&id))
                .unwrap_or(false);

        if !maybe_seen {
            self.stats.bloom_fast_path += 1;
            self.record(id);
            return true;
        }

        if self.seen.contains(&id) {
            self.stats.duplicates += 1;
            return false;
        }

        // Bloom false positive (or an id that aged out of the LRU); the
        // exact set is authoritative.
        self.record(id);
        true
    }

    /// Record an id we originated ourselves, to suppress echoes
    pub fn insert_local(&mut self, id: MessageId, now_unix: u64) {
        self.rotate_if_needed(now_unix);
        self.record(id);
    }

    fn record(&mut self, id: MessageId) {
        self.seen.put(id, ());
        self.current.insert(&id);
    }

    fn rotate_if_needed(&mut self, now_unix: u64) {
        let epoch = now_unix / SALT_EPOCH_SECS;
        if epoch != self.current.epoch {
            let retired = std::mem::replace(&mut self.current, SaltedBloom::new(epoch, &self.local_secret));
            self.previous = Some(retired);
            self.stats.rotations += 1;
        }

        // The retired filter only answers during the overlap window
        if let Some(previous) = &self.previous {
            let overlap_end = (previous.epoch + 1) * SALT_EPOCH_SECS + SALT_OVERLAP_SECS;
            if now_unix >= overlap_end {
                self.previous = None;
            }
        }
    }

    /// Drop all recorded ids (emergency wipe)
    pub fn clear(&mut self, now_unix: u64) {
        self.seen.clear();
        self.current = SaltedBloom::new(now_unix / SALT_EPOCH_SECS, &self.local_secret);
        self.previous = None;
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_400; // some wall-clock second

    #[test]
    fn test_first_seen_then_suppressed() {
        let mut dedup = MessageDeduplicator::with_secret([1; 32], T0);
        let id = MessageId::from_bytes([7; 16]);

        assert!(dedup.should_process(id, T0));
        assert!(!dedup.should_process(id, T0));
        assert!(!dedup.should_process(id, T0 + 5));
        assert_eq!(dedup.stats().duplicates, 2);
    }

    #[test]
    fn test_distinct_ids_pass() {
        let mut dedup = MessageDeduplicator::with_secret([1; 32], T0);
        for i in 0..100u8 {
            let id = MessageId::from_bytes([i; 16]);
            assert!(dedup.should_process(id, T0));
        }
        assert_eq!(dedup.stats().duplicates, 0);
    }

    #[test]
    fn test_local_insert_suppresses_echo() {
        let mut dedup = MessageDeduplicator::with_secret([1; 32], T0);
        let id = MessageId::from_bytes([9; 16]);

        dedup.insert_local(id, T0);
        assert!(!dedup.should_process(id, T0 + 1));
    }

    #[test]
    fn test_suppression_survives_rotation_overlap() {
        let mut dedup = MessageDeduplicator::with_secret([1; 32], T0);
        let id = MessageId::from_bytes([3; 16]);
        assert!(dedup.should_process(id, T0));

        // Cross the epoch boundary, still inside the overlap window
        let next_epoch_start = (T0 / SALT_EPOCH_SECS + 1) * SALT_EPOCH_SECS;
        assert!(!dedup.should_process(id, next_epoch_start + 60));
        assert_eq!(dedup.stats().rotations, 1);
    }

    #[test]
    fn test_overlap_filter_retired() {
        let mut dedup = MessageDeduplicator::with_secret([1; 32], T0);
        let id = MessageId::from_bytes([3; 16]);
        assert!(dedup.should_process(id, T0));

        let next_epoch_start = (T0 / SALT_EPOCH_SECS + 1) * SALT_EPOCH_SECS;
        // Past the overlap window the previous filter is gone, but the LRU
        // still answers as long as the id has not been evicted
        assert!(!dedup.should_process(id, next_epoch_start + SALT_OVERLAP_SECS + 1));
    }

    #[test]
    fn test_lru_eviction_bounds_memory() {
        let mut dedup = MessageDeduplicator::with_secret([1; 32], T0);
        for i in 0..(SEEN_CAPACITY + 100) {
            let mut bytes = [0u8; 16];
            bytes[..8].copy_from_slice(&(i as u64).to_be_bytes());
            dedup.should_process(MessageId::from_bytes(bytes), T0);
        }
        assert_eq!(dedup.len(), SEEN_CAPACITY);
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut dedup = MessageDeduplicator::with_secret([1; 32], T0);
        let id = MessageId::from_bytes([5; 16]);
        assert!(dedup.should_process(id, T0));

        dedup.clear(T0);
        assert!(dedup.is_empty());
        assert!(dedup.should_process(id, T0));
    }
}
