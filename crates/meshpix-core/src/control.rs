//! Control-message grammar: the short text frames that drive recovery.
//!
//! Control messages share the mesh port with data chunks. They are UTF-8,
//! single-frame, and headerless:
//!
//!   `OK:<hex8>`            transfer reassembled and verified
//!   `REQ:<hex8>:<i,...>`   receiver asks for the listed chunk indices
//!   `ACK:<hex8>:<i,...>`   receiver reports chunks on hand (legacy peers;
//!                          parsed for diagnostics, never emitted)
//!
//! Parsers are strict: a frame is a control message only when the entire
//! frame matches the grammar. Anything else falls through to data-frame
//! parsing, so a random transfer_id that happens to start with tag bytes
//! cannot be misrouted.

use crate::wire::MAX_FRAME;

pub const OK_TAG: &str = "OK:";
pub const REQ_TAG: &str = "REQ:";
pub const ACK_TAG: &str = "ACK:";

/// Most indices one `REQ:` can carry and still fit a single frame:
/// 13 bytes of tag + id + separator, then at most 4 bytes per index
/// ("255," worst case). Larger gaps are batched across frames.
pub const MAX_REQ_INDICES: usize = (MAX_FRAME - 13) / 4;

/// A parsed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Ok { transfer_id: u32 },
    Req { transfer_id: u32, indices: Vec<u8> },
    Ack { transfer_id: u32, indices: Vec<u8> },
}

impl ControlMessage {
    /// Parse an entire frame as a control message.
    pub fn parse(frame: &[u8]) -> Result<Self, ControlError> {
        if frame.len() > MAX_FRAME {
            return Err(ControlError::Malformed("frame too large"));
        }
        let text = std::str::from_utf8(frame).map_err(|_| ControlError::Malformed("not UTF-8"))?;

        if let Some(rest) = text.strip_prefix(OK_TAG) {
            let transfer_id = parse_hex8(rest)?;
            return Ok(ControlMessage::Ok { transfer_id });
        }
        if let Some(rest) = text.strip_prefix(REQ_TAG) {
            let (transfer_id, indices) = parse_id_and_indices(rest)?;
            return Ok(ControlMessage::Req {
                transfer_id,
                indices,
            });
        }
        if let Some(rest) = text.strip_prefix(ACK_TAG) {
            let (transfer_id, indices) = parse_id_and_indices(rest)?;
            return Ok(ControlMessage::Ack {
                transfer_id,
                indices,
            });
        }

        Err(ControlError::UnknownControl)
    }

    /// Render the message in wire form.
    pub fn encode(&self) -> String {
        match self {
            ControlMessage::Ok { transfer_id } => format!("{OK_TAG}{transfer_id:08x}"),
            ControlMessage::Req {
                transfer_id,
                indices,
            } => format!("{REQ_TAG}{transfer_id:08x}:{}", join_indices(indices)),
            ControlMessage::Ack {
                transfer_id,
                indices,
            } => format!("{ACK_TAG}{transfer_id:08x}:{}", join_indices(indices)),
        }
    }

    pub fn transfer_id(&self) -> u32 {
        match self {
            ControlMessage::Ok { transfer_id }
            | ControlMessage::Req { transfer_id, .. }
            | ControlMessage::Ack { transfer_id, .. } => *transfer_id,
        }
    }
}

/// Split a missing-index set into `REQ:` messages that each fit one frame.
pub fn req_batches(transfer_id: u32, missing: &[u8]) -> Vec<ControlMessage> {
    missing
        .chunks(MAX_REQ_INDICES)
        .map(|batch| ControlMessage::Req {
            transfer_id,
            indices: batch.to_vec(),
        })
        .collect()
}

/// True when the frame begins with one of the control tags, whether or not
/// the rest of it parses. Used to classify drops for diagnostics.
pub fn starts_with_control_tag(frame: &[u8]) -> bool {
    frame.starts_with(OK_TAG.as_bytes())
        || frame.starts_with(REQ_TAG.as_bytes())
        || frame.starts_with(ACK_TAG.as_bytes())
}

fn parse_hex8(s: &str) -> Result<u32, ControlError> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ControlError::Malformed("transfer id is not 8 hex digits"));
    }
    u32::from_str_radix(s, 16).map_err(|_| ControlError::Malformed("transfer id is not 8 hex digits"))
}

fn parse_id_and_indices(s: &str) -> Result<(u32, Vec<u8>), ControlError> {
    let (id_part, list_part) = s
        .split_once(':')
        .ok_or(ControlError::Malformed("missing index list"))?;
    let transfer_id = parse_hex8(id_part)?;

    if list_part.is_empty() {
        return Err(ControlError::Malformed("empty index list"));
    }
    let mut indices = Vec::new();
    for token in list_part.split(',') {
        let idx: u8 = token
            .parse()
            .map_err(|_| ControlError::Malformed("bad chunk index"))?;
        indices.push(idx);
    }
    Ok((transfer_id, indices))
}

fn join_indices(indices: &[u8]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("unknown control tag")]
    UnknownControl,

    #[error("malformed control message: {0}")]
    Malformed(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
