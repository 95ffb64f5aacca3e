// src/protocol/fragment.rs
//! Payload fragmentation and reassembly
//!
//! Payloads that do not fit the negotiated link MTU are split into
//! fragments, each riding its own packet (type `Fragment`) with its own
//! message id, TTL and routing. The fragment payload embeds the original
//! message id plus index/total counters; reassembly is keyed on the
//! embedded id, tracks arrival with a bitmap and gives up after
//! [`REASSEMBLY_TIMEOUT`].

use std::collections::HashMap;
use std::time::Instant;

use bitvec::prelude::*;
use byteorder::{BigEndian, ByteOrder};

use super::constants::*;
use super::error::{DecodeError, DecodeResult};
use super::MessageId;

/// Concurrent reassembly sessions kept before oldest-first eviction
const MAX_REASSEMBLY_RECORDS: usize = 128;

/// Fragment payload header: message_id(16) | index(2 BE) | total(2 BE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_id: MessageId,
    pub index: u16,
    pub total: u16,
}

impl FragmentHeader {
    pub fn encode(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let mut buffer = [0u8; FRAGMENT_HEADER_SIZE];
        buffer[..MESSAGE_ID_SIZE].copy_from_slice(self.message_id.as_bytes());
        BigEndian::write_u16(&mut buffer[MESSAGE_ID_SIZE..MESSAGE_ID_SIZE + 2], self.index);
        BigEndian::write_u16(&mut buffer[MESSAGE_ID_SIZE + 2..], self.total);
        buffer
    }

    pub fn decode(data: &[u8]) -> DecodeResult<(Self, &[u8])> {
        if data.len() < FRAGMENT_HEADER_SIZE {
            return Err(DecodeError::TooShort {
                expected: FRAGMENT_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut id = [0u8; MESSAGE_ID_SIZE];
        id.copy_from_slice(&data[..MESSAGE_ID_SIZE]);
        let index = BigEndian::read_u16(&data[MESSAGE_ID_SIZE..MESSAGE_ID_SIZE + 2]);
        let total = BigEndian::read_u16(&data[MESSAGE_ID_SIZE + 2..MESSAGE_ID_SIZE + 4]);

        if total == 0 {
            return Err(DecodeError::BadLengthField {
                field: "total_fragments",
                value: 0,
            });
        }
        if total as usize > MAX_FRAGMENTS {
            return Err(DecodeError::FieldExceedsLimit {
                field: "total_fragments",
                limit: MAX_FRAGMENTS,
                actual: total as usize,
            });
        }
        if index >= total {
            return Err(DecodeError::BadLengthField {
                field: "fragment_index",
                value: index as usize,
            });
        }

        Ok((
            Self {
                message_id: MessageId::from_bytes(id),
                index,
                total,
            },
            &data[FRAGMENT_HEADER_SIZE..],
        ))
    }
}

pub struct Fragmenter;

impl Fragmenter {
    /// Split a payload into fragment payloads (header + chunk), each small
    /// enough that the carrying packet fits `chunk_size` payload bytes.
    ///
    /// Returns `None` when the payload already fits a single chunk; the
    /// caller sends it unfragmented.
    pub fn split(
        message_id: MessageId,
        payload: &[u8],
        chunk_size: usize,
    ) -> DecodeResult<Option<Vec<Vec<u8>>>> {
        if chunk_size == 0 {
            return Err(DecodeError::BadLengthField {
                field: "chunk_size",
                value: 0,
            });
        }
        if payload.len() <= chunk_size {
            return Ok(None);
        }

        let total = payload.len().div_ceil(chunk_size);
        if total > MAX_FRAGMENTS {
            return Err(DecodeError::FieldExceedsLimit {
                field: "total_fragments",
                limit: MAX_FRAGMENTS,
                actual: total,
            });
        }

        let fragments = payload
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let header = FragmentHeader {
                    message_id,
                    index: index as u16,
                    total: total as u16,
                };
                let mut buffer = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
                buffer.extend_from_slice(&header.encode());
                buffer.extend_from_slice(chunk);
                buffer
            })
            .collect();

        Ok(Some(fragments))
    }

    /// Payload bytes available per fragment on a link, after the fixed
    /// packet header, the length field, optional addressing and the
    /// fragment header itself.
    pub fn chunk_capacity(link_mtu: usize, directed: bool) -> usize {
        let mut overhead = HEADER_SIZE + 2 + FRAGMENT_HEADER_SIZE;
        if directed {
            overhead += PEER_ID_SIZE;
        }
        link_mtu.saturating_sub(overhead)
    }
}

/// Outcome of feeding one fragment to the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyResult {
    /// All fragments arrived; the original payload, emitted exactly once
    Complete(Vec<u8>),
    /// Recorded; more fragments outstanding
    Pending,
    /// The fragment or its record was discarded (poisoned, inconsistent
    /// totals, or over limits)
    Discarded,
}

struct FragmentRecord {
    total: u16,
    received: BitVec,
    chunks: Vec<Option<Vec<u8>>>,
    bytes: usize,
    first_seen: Instant,
}

impl FragmentRecord {
    fn new(total: u16, now: Instant) -> Self {
        Self {
            total,
            received: bitvec![0; total as usize],
            chunks: vec![None; total as usize],
            bytes: 0,
            first_seen: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received.count_ones() == self.total as usize
    }

    fn assemble(mut self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.bytes);
        for chunk in self.chunks.iter_mut() {
            payload.extend_from_slice(chunk.take().unwrap_or_default().as_slice());
        }
        payload
    }
}

/// Stateful reassembly of fragmented payloads, keyed by the embedded
/// message id.
pub struct Reassembler {
    records: HashMap<MessageId, FragmentRecord>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Feed one fragment payload (header + chunk)
    pub fn insert(&mut self, data: &[u8], now: Instant) -> DecodeResult<ReassemblyResult> {
        let (header, chunk) = FragmentHeader::decode(data)?;

        let record = self
            .records
            .entry(header.message_id)
            .or_insert_with(|| FragmentRecord::new(header.total, now));

        // A total that disagrees with the existing record is a possible
        // attack; the whole record goes.
        if record.total != header.total {
            self.records.remove(&header.message_id);
            return Ok(ReassemblyResult::Discarded);
        }

        let index = header.index as usize;
        if let Some(existing) = &record.chunks[index] {
            if existing.as_slice() == chunk {
                return Ok(ReassemblyResult::Pending); // idempotent duplicate
            }
            // Conflicting bytes for the same index: poisoned
            self.records.remove(&header.message_id);
            return Ok(ReassemblyResult::Discarded);
        }

        if record.bytes + chunk.len() > MAX_PAYLOAD_SIZE {
            self.records.remove(&header.message_id);
            return Ok(ReassemblyResult::Discarded);
        }

        record.received.set(index, true);
        record.bytes += chunk.len();
        record.chunks[index] = Some(chunk.to_vec());

        if record.is_complete() {
            let record = self
                .records
                .remove(&header.message_id)
                .expect("record just inserted");
            return Ok(ReassemblyResult::Complete(record.assemble()));
        }

        self.enforce_capacity(header.message_id);
        Ok(ReassemblyResult::Pending)
    }

    /// Drop records older than [`REASSEMBLY_TIMEOUT`], returning their ids
    /// so the caller can surface the failures.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<MessageId> {
        let expired: Vec<MessageId> = self
            .records
            .iter()
            .filter(|(_, record)| now.duration_since(record.first_seen) > REASSEMBLY_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.records.remove(id);
        }
        expired
    }

    /// Number of in-flight reassembly sessions
    pub fn pending(&self) -> usize {
        self.records.len()
    }

    /// Drop all in-flight records
    pub fn clear(&mut self) {
        self.records.clear();
    }

    fn enforce_capacity(&mut self, just_touched: MessageId) {
        while self.records.len() > MAX_REASSEMBLY_RECORDS {
            let oldest = self
                .records
                .iter()
                .filter(|(id, _)| **id != just_touched)
                .min_by_key(|(_, record)| record.first_seen)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    self.records.remove(&id);
                }
                None => break,
            }
        }
    }
}
