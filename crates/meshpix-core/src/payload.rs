//! Payload encoding: CRC32 integrity and the compression decision.
//!
//! The checksum is CRC32 (IEEE polynomial) over the exact bytes that go on
//! the wire, which are also the bytes the receiver reassembles. When
//! compression is attempted, the compressed output replaces the raw payload
//! only if it saves more than 5%; the CRC is always computed on the bytes
//! actually selected.
//!
//! Compression is zlib. Deployed peers inflate with zlib, so the codec is
//! pinned; see DESIGN.md.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Payloads at or below this size are never worth compressing.
pub const MIN_COMPRESS_LEN: usize = 500;

/// Compressed output is kept only if it is smaller than this fraction of
/// the raw payload.
pub const COMPRESS_KEEP_RATIO: f64 = 0.95;

/// CRC32 (IEEE) over the on-wire payload bytes.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Whether to attempt payload compression for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressMode {
    /// Compress when it saves more than 5%.
    Auto,
    /// Always send the raw bytes.
    Off,
}

/// The bytes a transfer will put on the wire, after the compression
/// decision, plus the checksum of exactly those bytes.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub data: Bytes,
    pub compressed: bool,
    pub crc: u32,
}

/// Apply the compression decision to a raw blob.
///
/// Never fails: if the encoder errors or the savings are below threshold,
/// the raw bytes are used.
pub fn encode_payload(raw: &[u8], mode: CompressMode) -> EncodedPayload {
    if mode == CompressMode::Auto && raw.len() > MIN_COMPRESS_LEN {
        match deflate(raw) {
            Ok(z) if (z.len() as f64) < raw.len() as f64 * COMPRESS_KEEP_RATIO => {
                tracing::debug!(
                    raw = raw.len(),
                    compressed = z.len(),
                    "payload compression kept"
                );
                let crc = checksum(&z);
                return EncodedPayload {
                    data: Bytes::from(z),
                    compressed: true,
                    crc,
                };
            }
            Ok(z) => {
                tracing::debug!(
                    raw = raw.len(),
                    compressed = z.len(),
                    "compression not beneficial, sending raw"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "compression failed, sending raw");
            }
        }
    }

    EncodedPayload {
        data: Bytes::copy_from_slice(raw),
        compressed: false,
        crc: checksum(raw),
    }
}

/// Recover the original blob from reassembled on-wire bytes.
///
/// `limit` bounds the inflated size so a corrupt or hostile stream cannot
/// balloon memory.
pub fn decode_payload(data: &[u8], compressed: bool, limit: usize) -> Result<Vec<u8>, PayloadError> {
    if !compressed {
        return Ok(data.to_vec());
    }

    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = decoder.read(&mut buf).map_err(PayloadError::Decompress)?;
        if n == 0 {
            break;
        }
        if out.len() + n > limit {
            return Err(PayloadError::TooLarge(limit));
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

fn deflate(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::best());
    encoder.write_all(raw)?;
    encoder.finish()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),

    #[error("decompressed payload exceeds limit of {0} bytes")]
    TooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
