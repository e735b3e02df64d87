//! Live transfer status for UIs and diagnostics.
//!
//! Both engines publish [`TransferProgress`] rows into a [`ProgressBoard`];
//! observers take snapshots and never mutate. Frame-level drops that the
//! engines swallow on purpose are tallied in [`TransportCounters`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::buffer::{BufferStatus, TransferKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One transfer as a UI would render it.
#[derive(Debug, Clone, Serialize)]
pub struct TransferProgress {
    pub peer: crate::link::PeerId,
    pub transfer_id: u32,
    pub direction: Direction,
    pub bytes: u64,
    pub bytes_total: u64,
    pub chunks: u32,
    pub chunks_total: u32,
    pub percent: u8,
    pub elapsed_secs: f64,
    /// Payload bytes per second since the transfer started.
    pub rate_bps: f64,
    /// Seconds to completion at the current rate, when estimable.
    pub eta_secs: Option<f64>,
    /// Attempt success rate; outbound only.
    pub success_rate: Option<f64>,
    pub status: BufferStatus,
}

impl TransferProgress {
    pub fn new(
        key: TransferKey,
        direction: Direction,
        bytes: u64,
        bytes_total: u64,
        chunks: u32,
        chunks_total: u32,
        elapsed_secs: f64,
        status: BufferStatus,
    ) -> Self {
        let percent = if chunks_total > 0 {
            ((chunks as u64 * 100) / chunks_total as u64) as u8
        } else {
            0
        };
        let rate_bps = if elapsed_secs > 0.0 {
            bytes as f64 / elapsed_secs
        } else {
            0.0
        };
        let eta_secs = if rate_bps > 0.0 && bytes < bytes_total {
            Some((bytes_total - bytes) as f64 / rate_bps)
        } else {
            None
        };
        Self {
            peer: key.peer,
            transfer_id: key.transfer_id,
            direction,
            bytes,
            bytes_total,
            chunks,
            chunks_total,
            percent,
            elapsed_secs,
            rate_bps,
            eta_secs,
            success_rate: None,
            status,
        }
    }
}

/// Shared table of in-flight (and recently finished) transfers.
#[derive(Clone, Default)]
pub struct ProgressBoard {
    entries: Arc<DashMap<TransferKey, TransferProgress>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, progress: TransferProgress) {
        let key = TransferKey {
            peer: progress.peer,
            transfer_id: progress.transfer_id,
        };
        self.entries.insert(key, progress);
    }

    pub fn remove(&self, key: &TransferKey) {
        self.entries.remove(key);
    }

    pub fn get(&self, key: &TransferKey) -> Option<TransferProgress> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Point-in-time copy, ordered by peer then transfer id.
    pub fn snapshot(&self) -> Vec<TransferProgress> {
        let mut rows: Vec<TransferProgress> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        rows.sort_by_key(|r| (r.peer, r.transfer_id));
        rows
    }
}

// ── Drop counters ─────────────────────────────────────────────────────────────

/// Tallies for frames dropped without an error. The transport never aborts
/// on recoverable input; it counts and moves on.
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub malformed_frames: AtomicU64,
    pub oversize_frames: AtomicU64,
    pub unknown_control: AtomicU64,
    pub duplicate_chunks: AtomicU64,
    pub rejected_frames: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub malformed_frames: u64,
    pub oversize_frames: u64,
    pub unknown_control: u64,
    pub duplicate_chunks: u64,
    pub rejected_frames: u64,
}

impl TransportCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            oversize_frames: self.oversize_frames.load(Ordering::Relaxed),
            unknown_control: self.unknown_control.load(Ordering::Relaxed),
            duplicate_chunks: self.duplicate_chunks.load(Ordering::Relaxed),
            rejected_frames: self.rejected_frames.load(Ordering::Relaxed),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
