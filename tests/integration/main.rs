//! meshpix integration test harness.
//!
//! Every test runs a sender engine and a receiver engine over the
//! in-memory mesh with tokio's paused clock, so seconds-scale pacing and
//! minute-scale timeouts elapse in virtual time. Loss is injected through
//! the mesh drop filter; tests that need to inspect raw traffic attach an
//! extra subscription to the relevant endpoint.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use meshpix_core::config::{ReceiverConfig, SenderConfig};
use meshpix_core::wire::{Frame, DEFAULT_PORT};
use meshpix_transport::events::TransferEvent;
use meshpix_transport::link::memory::{MemoryLink, MemoryMesh};
use meshpix_transport::link::{LinkDriver, PeerId};
use meshpix_transport::receiver::Receiver;
use meshpix_transport::sender::Sender;

mod adaptive;
mod failures;
mod recovery;

// ── Harness ───────────────────────────────────────────────────────────────────

/// The two node ids used throughout tests.
pub const CAMERA: PeerId = PeerId(0x0a00_0001);
pub const GALLERY: PeerId = PeerId(0x0b00_0002);

pub struct TestNet {
    pub mesh: MemoryMesh,
    pub sender: Sender,
    pub receiver: Receiver,
    pub events: mpsc::Receiver<TransferEvent>,
    pub camera_link: MemoryLink,
    pub gallery_link: MemoryLink,
}

/// Build a camera→gallery pair with the given configs.
pub fn test_net_with(sender_config: SenderConfig, receiver_config: ReceiverConfig) -> TestNet {
    init_tracing();
    let mesh = MemoryMesh::new();
    let camera_link = mesh.endpoint(CAMERA);
    let gallery_link = mesh.endpoint(GALLERY);

    let sender = Sender::spawn(
        Arc::new(camera_link.clone()),
        DEFAULT_PORT,
        sender_config,
    );
    let (receiver, events) = Receiver::spawn(
        Arc::new(gallery_link.clone()),
        DEFAULT_PORT,
        receiver_config,
    );

    TestNet {
        mesh,
        sender,
        receiver,
        events,
        camera_link,
        gallery_link,
    }
}

pub fn test_net() -> TestNet {
    test_net_with(SenderConfig::default(), ReceiverConfig::default())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Blobs ─────────────────────────────────────────────────────────────────────

/// Deterministic high-entropy bytes; survives the compression decision
/// unchanged.
pub fn random_blob(len: usize, seed: u64) -> Bytes {
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.push(state as u8);
    }
    Bytes::from(out)
}

/// Deterministic redundant bytes; compresses heavily.
pub fn redundant_blob(len: usize) -> Bytes {
    Bytes::from(vec![0x42u8; len])
}

// ── Frame crafting ────────────────────────────────────────────────────────────

/// Fragment a blob exactly as the sender engine would, without engaging
/// the engine. Used by tests that inject frames by hand.
pub fn raw_frames(transfer_id: u32, blob: &[u8], capacity: usize) -> Vec<Bytes> {
    let total = meshpix_core::wire::chunk_count(blob.len(), capacity);
    let crc = meshpix_core::payload::checksum(blob);
    blob.chunks(capacity)
        .enumerate()
        .map(|(index, data)| {
            let frame = Frame {
                transfer_id,
                total_chunks: total as u8,
                chunk_index: index as u8,
                compressed: false,
                crc32: crc,
                total_size: blob.len() as u32,
                payload: Bytes::copy_from_slice(data),
            };
            Bytes::from(frame.encode().expect("test frame must encode"))
        })
        .collect()
}

/// Deliver one raw datagram from the camera to the gallery.
pub async fn inject(net: &TestNet, payload: Bytes) {
    net.camera_link
        .send(GALLERY, DEFAULT_PORT, payload, false)
        .await
        .expect("in-memory link should accept the frame");
}

// ── Event helpers ─────────────────────────────────────────────────────────────

/// Wait for the next completion, failing the test on a Failed event.
pub async fn expect_completed(events: &mut mpsc::Receiver<TransferEvent>) -> (PeerId, u32, Bytes) {
    match events.recv().await {
        Some(TransferEvent::Completed {
            peer,
            transfer_id,
            blob,
        }) => (peer, transfer_id, blob),
        Some(TransferEvent::Failed {
            transfer_id, kind, ..
        }) => panic!("transfer {transfer_id:08x} failed: {kind}"),
        None => panic!("event channel closed before completion"),
    }
}
