//! meshpix-transport: the sender and receiver engines of the meshpix
//! image transport.
//!
//! The transport moves a single blob (an encoded image) across a lossy
//! ~200-byte datagram link by fragmenting it into CRC-protected chunks,
//! pacing transmission, and negotiating recovery of missing chunks through
//! the text control channel. The mesh radio itself is reached through the
//! [`link::LinkDriver`] trait; an in-memory implementation for tests and
//! demos lives in [`link::memory`].

pub mod adaptive;
pub mod buffer;
pub mod events;
pub mod link;
pub mod progress;
pub mod receiver;
pub mod sender;

pub use buffer::{BufferStatus, InsertOutcome, TransferBuffer, TransferKey};
pub use events::{FailureKind, TransferEvent, TransferOutcome, TransferStats};
pub use link::{InboundFrame, LinkDriver, LinkError, PeerId, SendReport};
pub use receiver::Receiver;
pub use sender::{SendError, SendOptions, Sender, TransferHandle};
