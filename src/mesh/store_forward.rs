//! Store-and-forward queue for offline recipients
//!
//! Direct packets for peers that are known but not currently connected
//! wait here. Queues are bounded per recipient and globally; overflow
//! evicts the oldest queued packet first. Draining returns packets in
//! arrival order.

use std::collections::{HashMap, VecDeque};

use crate::protocol::{BitchatPacket, PeerId, OFFLINE_QUEUE_PER_RECIPIENT, OFFLINE_QUEUE_TOTAL};

/// Queue counters for monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineStoreStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub drained: u64,
}

/// Bounded offline store keyed by recipient
pub struct OfflineStore {
    queues: HashMap<PeerId, VecDeque<(u64, BitchatPacket)>>,
    total: usize,
    next_seq: u64,
    stats: OfflineStoreStats,
}

impl OfflineStore {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            total: 0,
            next_seq: 0,
            stats: OfflineStoreStats::default(),
        }
    }

    /// Queue a packet for a currently unreachable recipient
    pub fn enqueue(&mut self, recipient: PeerId, packet: BitchatPacket) {
        let queue = self.queues.entry(recipient).or_default();
        if queue.len() >= OFFLINE_QUEUE_PER_RECIPIENT {
            queue.pop_front();
            self.total -= 1;
            self.stats.dropped += 1;
        }

        queue.push_back((self.next_seq, packet));
        self.next_seq += 1;
        self.total += 1;
        self.stats.enqueued += 1;

        while self.total > OFFLINE_QUEUE_TOTAL {
            self.evict_globally_oldest();
        }
    }

    /// Remove every queued packet for `recipient`, in arrival order
    pub fn drain(&mut self, recipient: PeerId) -> Vec<BitchatPacket> {
        match self.queues.remove(&recipient) {
            Some(queue) => {
                self.total -= queue.len();
                self.stats.drained += queue.len() as u64;
                queue.into_iter().map(|(_, packet)| packet).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn queued_for(&self, recipient: &PeerId) -> usize {
        self.queues.get(recipient).map(VecDeque::len).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn stats(&self) -> OfflineStoreStats {
        self.stats
    }

    /// Drop everything (emergency wipe)
    pub fn clear(&mut self) {
        self.queues.clear();
        self.total = 0;
    }

    fn evict_globally_oldest(&mut self) {
        let victim = self
            .queues
            .iter()
            .filter_map(|(recipient, queue)| queue.front().map(|(seq, _)| (*seq, *recipient)))
            .min()
            .map(|(_, recipient)| recipient);

        if let Some(recipient) = victim {
            if let Some(queue) = self.queues.get_mut(&recipient) {
                queue.pop_front();
                self.total -= 1;
                self.stats.dropped += 1;
                if queue.is_empty() {
                    self.queues.remove(&recipient);
                }
            }
        }
    }
}

impl Default for OfflineStore {
    fn default() -> Self {
        Self::new()
    }
}
