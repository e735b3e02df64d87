//! meshpix wire format: on-wire types for image chunk frames.
//!
//! These types ARE the protocol. Every field, every size, every byte order
//! is part of the wire format and must stay byte-exact with deployed peers.
//! A data frame is a 15-byte header followed by chunk bytes; control frames
//! (see `control`) share the same mesh port and carry no header.
//!
//! The header is #[repr(C, packed)] for deterministic layout and uses
//! zerocopy derives for safe, allocation-free serialization. Multi-byte
//! fields are big-endian. There is no unsafe code in this module.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Maximum datagram the mesh link will carry.
pub const MAX_FRAME: usize = 237;

/// Size of the data-chunk header in bytes.
pub const HEADER_LEN: usize = 15;

/// Default chunk size (header + data) used when fragmenting a payload.
/// Leaves 185 data bytes per frame.
pub const DEFAULT_CHUNK_SIZE: usize = 200;

/// A transfer is at most 255 chunks; `total_chunks` is a single byte.
pub const MAX_CHUNKS: usize = 255;

/// Mesh port shared by data chunks and control messages.
pub const DEFAULT_PORT: u16 = 256;

/// Upper bound on `total_size`. Anything larger is treated as a corrupt
/// or hostile header, not a real image.
pub const MAX_TOTAL_SIZE: u32 = 10_000_000;

// ── Frame header ──────────────────────────────────────────────────────────────

/// The 15-byte header that precedes every data chunk.
///
/// The receiver can allocate and key the reassembly buffer from this header
/// alone: `transfer_id` disambiguates transfers from the same peer,
/// `total_chunks`/`total_size` size the buffer, and `crc32` is the checksum
/// of the complete on-wire payload (the compressed bytes when
/// `compressed != 0`, never the original).
///
/// Wire size: 15 bytes, big-endian multi-byte fields.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Random 32-bit identifier chosen by the sender per transfer.
    pub transfer_id: U32<BigEndian>,

    /// Chunk count in [1, 255]. Zero is rejected on parse.
    pub total_chunks: u8,

    /// Zero-based index; must be < total_chunks.
    pub chunk_index: u8,

    /// 0 = raw payload, nonzero = zlib-compressed payload.
    pub compressed: u8,

    /// CRC32 (IEEE) of the complete on-wire payload bytes.
    pub crc32: U32<BigEndian>,

    /// Byte length of the complete on-wire payload.
    pub total_size: U32<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 15]);

// ── Frame ─────────────────────────────────────────────────────────────────────

/// A parsed data chunk: the header fields plus the chunk bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transfer_id: u32,
    pub total_chunks: u8,
    pub chunk_index: u8,
    pub compressed: bool,
    pub crc32: u32,
    pub total_size: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Serialize the frame: 15-byte header followed by the chunk bytes.
    ///
    /// Rejects frames that would exceed `MAX_FRAME` or carry an
    /// inconsistent header.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let len = HEADER_LEN + self.payload.len();
        if len > MAX_FRAME {
            return Err(WireError::FrameTooLarge(len));
        }
        if self.total_chunks == 0 {
            return Err(WireError::MalformedHeader("total_chunks is zero"));
        }
        if self.chunk_index >= self.total_chunks {
            return Err(WireError::MalformedHeader("chunk_index out of range"));
        }

        let header = FrameHeader {
            transfer_id: U32::new(self.transfer_id),
            total_chunks: self.total_chunks,
            chunk_index: self.chunk_index,
            compressed: self.compressed as u8,
            crc32: U32::new(self.crc32),
            total_size: U32::new(self.total_size),
        };

        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a datagram as a data chunk. Pure; no I/O.
    ///
    /// Rejects truncated frames, oversize frames, a zero chunk count,
    /// an out-of-range index, and an implausible `total_size`.
    pub fn parse(buf: &[u8]) -> Result<Frame, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::MalformedHeader("truncated frame"));
        }
        if buf.len() > MAX_FRAME {
            return Err(WireError::FrameTooLarge(buf.len()));
        }

        let header = FrameHeader::read_from_prefix(&buf[..HEADER_LEN])
            .ok_or(WireError::MalformedHeader("unreadable header"))?;

        let total_chunks = header.total_chunks;
        if total_chunks == 0 {
            return Err(WireError::MalformedHeader("total_chunks is zero"));
        }
        if header.chunk_index >= total_chunks {
            return Err(WireError::MalformedHeader("chunk_index out of range"));
        }
        let total_size = header.total_size.get();
        if total_size == 0 {
            return Err(WireError::MalformedHeader("total_size is zero"));
        }
        if total_size > MAX_TOTAL_SIZE {
            return Err(WireError::MalformedHeader("implausible total_size"));
        }

        Ok(Frame {
            transfer_id: header.transfer_id.get(),
            total_chunks,
            chunk_index: header.chunk_index,
            // Deployed peers emit 0 or 1; any nonzero flag means compressed.
            compressed: header.compressed != 0,
            crc32: header.crc32.get(),
            total_size,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..]),
        })
    }
}

// ── Fragmentation helpers ─────────────────────────────────────────────────────

/// Data bytes carried per frame for a given chunk size.
pub fn chunk_capacity(chunk_size: usize) -> usize {
    chunk_size.saturating_sub(HEADER_LEN)
}

/// Number of chunks needed for `total_size` payload bytes.
pub fn chunk_count(total_size: usize, capacity: usize) -> usize {
    if capacity == 0 {
        return 0;
    }
    (total_size + capacity - 1) / capacity
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    #[error("frame length {0} exceeds maximum {}", MAX_FRAME)]
    FrameTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
