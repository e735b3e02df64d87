//! Corruption, timeouts, cancellation, and frame-level rejection.

use std::time::Duration;

use bytes::Bytes;
use meshpix_core::payload::{checksum, CompressMode};
use meshpix_core::wire::{chunk_capacity, Frame, HEADER_LEN};
use meshpix_transport::buffer::BufferStatus;
use meshpix_transport::events::{FailureKind, TransferEvent, TransferOutcome};
use meshpix_transport::link::LinkDriver;
use meshpix_transport::sender::SendOptions;

use crate::*;

fn fast_uncompressed() -> SendOptions {
    SendOptions {
        fast: true,
        compress: Some(CompressMode::Off),
        ..Default::default()
    }
}

async fn expect_failed(
    events: &mut tokio::sync::mpsc::Receiver<TransferEvent>,
) -> (u32, FailureKind) {
    match events.recv().await {
        Some(TransferEvent::Failed {
            transfer_id, kind, ..
        }) => (transfer_id, kind),
        Some(TransferEvent::Completed { transfer_id, .. }) => {
            panic!("transfer {transfer_id:08x} unexpectedly completed")
        }
        None => panic!("event channel closed"),
    }
}

#[tokio::test(start_paused = true)]
async fn corrupt_chunk_fails_crc_and_never_completes() {
    let mut net = test_net();

    let capacity = chunk_capacity(200);
    let blob = random_blob(185 * 8, 61);
    let mut frames = raw_frames(0x0bad_cafe, &blob, capacity);

    // Flip one payload bit in chunk 3; the header (and its CRC field)
    // stays intact.
    let mut corrupted = frames[3].to_vec();
    corrupted[HEADER_LEN + 10] ^= 0x01;
    frames[3] = Bytes::from(corrupted);

    for frame in &frames {
        inject(&net, frame.clone()).await;
    }

    let (id, kind) = expect_failed(&mut net.events).await;
    assert_eq!(id, 0x0bad_cafe);
    assert_eq!(kind, FailureKind::CrcMismatch);

    // The corrupt buffer is retained, visible to the operator as
    // timed out, until the sweeper ages it away.
    let rows = net.receiver.progress();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, BufferStatus::Timeout);
    assert!(net.events.try_recv().is_err(), "no completion may follow");
}

#[tokio::test(start_paused = true)]
async fn undecompressable_payload_fails() {
    let mut net = test_net();

    // The compressed flag is set but the payload is noise. The CRC is
    // valid for the noise, so only inflation can fail.
    let garbage = random_blob(400, 67);
    let frames: Vec<Bytes> = {
        let total = 3u8;
        garbage
            .chunks(185)
            .enumerate()
            .map(|(index, data)| {
                let frame = Frame {
                    transfer_id: 0x00de_f1a7,
                    total_chunks: total,
                    chunk_index: index as u8,
                    compressed: true,
                    crc32: checksum(&garbage),
                    total_size: garbage.len() as u32,
                    payload: Bytes::copy_from_slice(data),
                };
                Bytes::from(frame.encode().unwrap())
            })
            .collect()
    };
    for frame in &frames {
        inject(&net, frame.clone()).await;
    }

    let (id, kind) = expect_failed(&mut net.events).await;
    assert_eq!(id, 0x00de_f1a7);
    assert_eq!(kind, FailureKind::DecompressError);
}

#[tokio::test(start_paused = true)]
async fn stale_buffer_times_out_then_ages_away() {
    let mut net = test_net();

    let capacity = chunk_capacity(200);
    let blob = random_blob(185 * 40, 71);
    let frames = raw_frames(0x57a1_e001, &blob, capacity);
    for frame in frames.iter().take(30) {
        inject(&net, frame.clone()).await;
    }

    // Silence. The sweeper marks the transfer timed out once the idle
    // window passes.
    tokio::time::sleep(Duration::from_secs(80)).await;
    let (id, kind) = expect_failed(&mut net.events).await;
    assert_eq!(id, 0x57a1_e001);
    assert_eq!(kind, FailureKind::Timeout);

    let rows = net.receiver.progress();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, BufferStatus::Timeout);
    assert_eq!(rows[0].chunks, 30);

    // Twice the transfer timeout after the last chunk, the buffer and its
    // progress row are gone.
    tokio::time::sleep(Duration::from_secs(70)).await;
    assert!(net.receiver.progress().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_aborts_mid_transfer() {
    let net = test_net();

    let blob = random_blob(185 * 10, 73);
    let handle = net
        .sender
        .send_blob(
            GALLERY,
            blob,
            SendOptions {
                compress: Some(CompressMode::Off),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // A couple of chunks go out at the default 4 s pace, then the caller
    // changes its mind.
    tokio::time::sleep(Duration::from_secs(6)).await;
    handle.cancel();
    let outcome = handle.await_completion().await;
    assert_eq!(outcome, TransferOutcome::Failed(FailureKind::Cancelled));

    // The outbound progress row is released.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(net.sender.progress().is_empty());
}

#[tokio::test(start_paused = true)]
async fn fatal_link_error_fails_the_transfer() {
    let net = test_net();

    let blob = random_blob(185 * 10, 79);
    let handle = net
        .sender
        .send_blob(GALLERY, blob, fast_uncompressed())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    net.camera_link.close().await;

    let outcome = handle.await_completion().await;
    assert_eq!(outcome, TransferOutcome::Failed(FailureKind::Link));
}

#[tokio::test(start_paused = true)]
async fn frame_level_drops_are_counted_not_fatal() {
    let mut net = test_net();

    // Truncated header.
    inject(&net, Bytes::from_static(&[0u8; 10])).await;
    // Tagged like control but fails the grammar.
    inject(&net, Bytes::from_static(b"REQ:zz")).await;
    // Oversize datagram.
    inject(&net, Bytes::from(vec![1u8; 300])).await;

    // Parameter mismatch against an existing buffer.
    let blob = random_blob(600, 83);
    let frames = raw_frames(0x0000_0123, &blob, chunk_capacity(200));
    inject(&net, frames[0].clone()).await;
    let mut alien = Frame::parse(&frames[1]).unwrap();
    alien.total_size += 1;
    alien.crc32 ^= 0xffff;
    inject(&net, Bytes::from(alien.encode().unwrap())).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let counters = net.receiver.counters();
    assert_eq!(counters.malformed_frames, 1);
    assert_eq!(counters.unknown_control, 1);
    assert_eq!(counters.oversize_frames, 1);
    assert_eq!(counters.rejected_frames, 1);

    // The legitimate transfer is still alive and can finish.
    for frame in frames.iter().skip(1) {
        inject(&net, frame.clone()).await;
    }
    let (_, id, received) = expect_completed(&mut net.events).await;
    assert_eq!(id, 0x0000_0123);
    assert_eq!(received, blob);
}

#[tokio::test(start_paused = true)]
async fn link_pause_window_is_survivable() {
    let mut net = test_net();

    let blob = random_blob(185 * 20, 89);
    let handle = net
        .sender
        .send_blob(GALLERY, blob.clone(), fast_uncompressed())
        .await
        .unwrap();

    // The gallery radio goes quiet for a while mid-transfer, as it would
    // during a subprocess handoff on the other side.
    tokio::time::sleep(Duration::from_secs(5)).await;
    net.gallery_link.pause().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    net.gallery_link.resume().await;

    assert!(matches!(
        handle.await_completion().await,
        TransferOutcome::Done(_)
    ));
    let (_, _, received) = expect_completed(&mut net.events).await;
    assert_eq!(received, blob);
}
