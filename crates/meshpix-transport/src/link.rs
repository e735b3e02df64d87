//! Link driver contract: the seam between the transport and the mesh radio.
//!
//! The transport never touches a serial port or a socket. It submits
//! datagrams to a [`LinkDriver`] and consumes the frames the driver
//! delivers. A process holds at most one link session; the driver is a
//! single-writer resource, and an orchestrator that needs to hand the
//! radio to a subprocess must `pause()` the link first and `resume()` it
//! afterwards.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod memory;

// ── Peer identity ─────────────────────────────────────────────────────────────

/// A mesh node id, displayed in the radio's `!xxxxxxxx` convention.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('!').unwrap_or(s);
        if hex.len() != 8 {
            return Err(PeerIdParseError);
        }
        u32::from_str_radix(hex, 16)
            .map(PeerId)
            .map_err(|_| PeerIdParseError)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("peer id must be 8 hex digits, optionally prefixed with '!'")]
pub struct PeerIdParseError;

// ── Driver contract ───────────────────────────────────────────────────────────

/// Per-datagram result reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReport {
    /// The link-layer acknowledgement arrived (or none was requested).
    AckOk,
    /// No acknowledgement within the driver's deadline.
    AckTimeout,
    /// The driver failed to transmit this datagram.
    Failed,
}

/// Fatal link-session errors. Anything surfaced here ends the in-flight
/// transfer; per-datagram trouble is reported through [`SendReport`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum LinkError {
    #[error("link session closed")]
    Closed,

    #[error("link i/o failure: {0}")]
    Io(String),
}

/// A datagram delivered by the driver.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub peer: PeerId,
    pub payload: Bytes,
}

/// The mesh radio as the transport sees it.
///
/// `subscribe` follows the radio library's pubsub model: every subscriber
/// on a port observes every frame delivered to that port, so the sender
/// engine (control messages) and receiver engine (data chunks) can share
/// one session.
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Transmit one datagram. `want_ack` requests a link-layer
    /// acknowledgement; the call resolves when the driver knows the
    /// outcome. `Err` means the session itself is gone.
    async fn send(
        &self,
        peer: PeerId,
        port: u16,
        payload: Bytes,
        want_ack: bool,
    ) -> Result<SendReport, LinkError>;

    /// Register a consumer for frames arriving on `port`.
    fn subscribe(&self, port: u16) -> mpsc::Receiver<InboundFrame>;

    /// Quiesce the link so another process may use the radio.
    async fn pause(&self);

    /// Re-take the link after a `pause`.
    async fn resume(&self);

    /// Tear the session down. Subsequent sends fail with `Closed`.
    async fn close(&self);
}
