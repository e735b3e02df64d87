//! Per-transfer reassembly state.
//!
//! A [`TransferBuffer`] is pure data: the receiver engine owns the map of
//! buffers and serializes every mutation. Identity is `(peer, transfer_id)`;
//! two transfers from the same peer with distinct ids coexist.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::time::Instant;

use meshpix_core::wire::Frame;

use crate::link::PeerId;

/// Unique identity of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TransferKey {
    pub peer: PeerId,
    pub transfer_id: u32,
}

impl std::fmt::Display for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:08x}", self.peer, self.transfer_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferStatus {
    Active,
    Timeout,
    Complete,
}

/// Result of offering a chunk to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First time this slot was filled.
    New,
    /// Slot already held bytes; counted, not an error.
    Duplicate,
    /// Frame disagrees with the transfer parameters seen first.
    Rejected,
}

/// Assembly state for one inbound transfer.
#[derive(Debug)]
pub struct TransferBuffer {
    peer: PeerId,
    transfer_id: u32,
    chunks: Vec<Option<Bytes>>,
    received: usize,
    bytes_received: u64,
    duplicates: u64,
    expected_total_size: u32,
    expected_crc: u32,
    compressed: bool,
    /// Data bytes per full slot, learned from the first non-final chunk.
    capacity: Option<usize>,
    status: BufferStatus,
    started: Instant,
    last_update: Instant,
}

impl TransferBuffer {
    /// Allocate a buffer from the first frame seen for a key. Does not
    /// insert the frame.
    pub fn from_frame(peer: PeerId, frame: &Frame) -> Self {
        let now = Instant::now();
        Self {
            peer,
            transfer_id: frame.transfer_id,
            chunks: vec![None; frame.total_chunks as usize],
            received: 0,
            bytes_received: 0,
            duplicates: 0,
            expected_total_size: frame.total_size,
            expected_crc: frame.crc32,
            compressed: frame.compressed,
            capacity: None,
            status: BufferStatus::Active,
            started: now,
            last_update: now,
        }
    }

    /// Whether a frame's declared parameters agree with this buffer.
    /// A new transfer reusing an in-flight id is treated as spurious.
    pub fn matches(&self, frame: &Frame) -> bool {
        frame.transfer_id == self.transfer_id
            && frame.total_chunks as usize == self.chunks.len()
            && frame.total_size == self.expected_total_size
            && frame.crc32 == self.expected_crc
            && frame.compressed == self.compressed
    }

    /// Offer a chunk. First write wins; refills are duplicates.
    pub fn insert(&mut self, frame: &Frame) -> InsertOutcome {
        if !self.matches(frame) {
            return InsertOutcome::Rejected;
        }
        let index = frame.chunk_index as usize;
        if index >= self.chunks.len() {
            return InsertOutcome::Rejected;
        }
        if !self.slot_length_ok(index, frame.payload.len()) {
            return InsertOutcome::Rejected;
        }

        if self.chunks[index].is_some() {
            self.duplicates += 1;
            self.touch();
            return InsertOutcome::Duplicate;
        }

        if index + 1 < self.chunks.len() {
            self.capacity = Some(frame.payload.len());
        }
        self.bytes_received += frame.payload.len() as u64;
        self.received += 1;
        self.chunks[index] = Some(frame.payload.clone());
        self.touch();
        InsertOutcome::New
    }

    /// Every slot except possibly the last must carry the full per-chunk
    /// capacity; the advertised total must be reachable.
    fn slot_length_ok(&self, index: usize, len: usize) -> bool {
        let total = self.chunks.len();
        let last = index + 1 == total;
        if last {
            if total == 1 {
                return len == self.expected_total_size as usize;
            }
            // The tail carries whatever remains once the full-slot size
            // is known; until then only the obvious bounds apply.
            if let Some(cap) = self.capacity {
                return len == self.expected_total_size as usize - cap * (total - 1);
            }
            return len > 0 && len <= self.expected_total_size as usize;
        }
        match self.capacity {
            Some(cap) => len == cap,
            None => {
                // First non-final chunk defines the capacity; it must be
                // consistent with the advertised chunk count.
                len > 0
                    && len * total >= self.expected_total_size as usize
                    && len * (total - 1) < self.expected_total_size as usize
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.chunks.len()
    }

    /// Concatenate all slots. Call only when `is_complete()`.
    pub fn assemble(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.expected_total_size as usize);
        for slot in self.chunks.iter().flatten() {
            out.extend_from_slice(slot);
        }
        out.freeze()
    }

    /// Indices not yet received, in order.
    pub fn missing(&self) -> Vec<u8> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as u8)
            .collect()
    }

    /// Advance the activity clock.
    pub fn touch(&mut self) {
        self.last_update = Instant::now();
    }

    pub fn mark_timeout(&mut self) {
        self.status = BufferStatus::Timeout;
    }

    pub fn mark_complete(&mut self) {
        self.status = BufferStatus::Complete;
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    pub fn key(&self) -> TransferKey {
        TransferKey {
            peer: self.peer,
            transfer_id: self.transfer_id,
        }
    }

    pub fn status(&self) -> BufferStatus {
        self.status
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn received_chunks(&self) -> usize {
        self.received
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn expected_total_size(&self) -> u32 {
        self.expected_total_size
    }

    pub fn expected_crc(&self) -> u32 {
        self.expected_crc
    }

    pub fn compressed(&self) -> bool {
        self.compressed
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
