//! Transfer lifecycle events surfaced to the application.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::link::PeerId;

/// Why a transfer ended without a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Assembled bytes did not match the advertised checksum.
    CrcMismatch,
    /// The relevant wall-clock budget elapsed.
    Timeout,
    /// The payload was flagged compressed but would not inflate.
    DecompressError,
    /// The submitted blob or an inbound frame could not be used.
    MalformedInput,
    /// The link driver reported a fatal session error.
    Link,
    /// Caller-initiated cancel.
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::CrcMismatch => "crc mismatch",
            FailureKind::Timeout => "timeout",
            FailureKind::DecompressError => "decompress error",
            FailureKind::MalformedInput => "malformed input",
            FailureKind::Link => "link failure",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Receiver-side notifications delivered on the event channel.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A transfer reassembled, verified, and decompressed cleanly.
    Completed {
        peer: PeerId,
        transfer_id: u32,
        blob: Bytes,
    },
    /// A transfer ended without a usable blob.
    Failed {
        peer: PeerId,
        transfer_id: u32,
        kind: FailureKind,
    },
}

/// Final word on an outbound transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Done(TransferStats),
    Failed(FailureKind),
}

/// Counters accumulated over one outbound transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferStats {
    pub transfer_id: u32,
    pub chunks: u32,
    pub bytes: u64,
    pub retries: u32,
    #[serde(skip)]
    pub elapsed: Duration,
    pub final_delay_secs: f64,
}
