//! Loss, duplication, and reordering: the recovery half of the protocol.

use std::collections::HashMap;

use meshpix_core::control::ControlMessage;
use meshpix_core::payload::CompressMode;
use meshpix_core::wire::{chunk_capacity, Frame, DEFAULT_PORT};
use meshpix_transport::events::TransferOutcome;
use meshpix_transport::link::LinkDriver;
use meshpix_transport::sender::SendOptions;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::*;

fn fast_uncompressed() -> SendOptions {
    SendOptions {
        fast: true,
        compress: Some(CompressMode::Off),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn mid_transfer_loss_recovers_via_req() {
    let mut net = test_net();
    let mut ctrl_tap = net.camera_link.subscribe(DEFAULT_PORT);

    // Chunks 7, 23, 24, and 41 vanish for the whole first pass (three
    // link-layer attempts each); the fourth occurrence, the REQ-driven
    // retransmission, goes through.
    let mut seen: HashMap<u8, u32> = HashMap::new();
    net.mesh.set_drop_filter(move |frame| {
        let Ok(parsed) = Frame::parse(frame.payload) else {
            return false;
        };
        if ![7u8, 23, 24, 41].contains(&parsed.chunk_index) {
            return false;
        }
        let count = seen.entry(parsed.chunk_index).or_insert(0);
        *count += 1;
        *count <= 3
    });

    let blob = random_blob(185 * 50, 3);
    let handle = net
        .sender
        .send_blob(GALLERY, blob.clone(), fast_uncompressed())
        .await
        .unwrap();
    let transfer_id = handle.transfer_id();

    // The stall sweep names exactly the missing indices.
    let req = loop {
        let frame = ctrl_tap.recv().await.expect("control tap closed");
        if let Ok(ControlMessage::Req {
            transfer_id: id,
            indices,
        }) = ControlMessage::parse(&frame.payload)
        {
            assert_eq!(id, transfer_id);
            break indices;
        }
    };
    assert_eq!(req, vec![7, 23, 24, 41]);

    assert!(matches!(
        handle.await_completion().await,
        TransferOutcome::Done(_)
    ));
    let (_, id, received) = expect_completed(&mut net.events).await;
    assert_eq!(id, transfer_id);
    assert_eq!(received, blob);
}

#[tokio::test(start_paused = true)]
async fn steady_loss_recovers() {
    let mut net = test_net();

    // Every fifth data frame on the mesh disappears; control traffic is
    // spared so the test exercises chunk recovery, not REQ re-issue.
    net.mesh.set_drop_filter(|frame| {
        Frame::parse(frame.payload).is_ok() && frame.seq % 5 == 0
    });

    let blob = random_blob(185 * 40, 17);
    let handle = net
        .sender
        .send_blob(GALLERY, blob.clone(), fast_uncompressed())
        .await
        .unwrap();

    assert!(matches!(
        handle.await_completion().await,
        TransferOutcome::Done(_)
    ));
    let (_, _, received) = expect_completed(&mut net.events).await;
    assert_eq!(received, blob);
    assert!(net.mesh.frames_dropped() > 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_frames_are_idempotent() {
    let mut net = test_net();
    let mut ctrl_tap = net.camera_link.subscribe(DEFAULT_PORT);

    let capacity = chunk_capacity(200);
    let blob = random_blob(1000, 29); // 6 chunks: 5 × 185 + 75
    let frames = raw_frames(0x00c0_ffee, &blob, capacity);
    assert_eq!(frames.len(), 6);

    // Deliver every non-final frame i a total of i+1 times, then the
    // final frame once to complete.
    let mut expected_duplicates = 0u64;
    for (i, frame) in frames.iter().take(5).enumerate() {
        for _ in 0..=i {
            inject(&net, frame.clone()).await;
        }
        expected_duplicates += i as u64;
    }
    inject(&net, frames[5].clone()).await;

    let (peer, id, received) = expect_completed(&mut net.events).await;
    assert_eq!(peer, CAMERA);
    assert_eq!(id, 0x00c0_ffee);
    assert_eq!(received, blob);

    let counters = net.receiver.counters();
    assert_eq!(counters.duplicate_chunks, expected_duplicates);
    assert_eq!(counters.rejected_frames, 0);

    // A straggler after completion earns a fresh OK, not a new buffer.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    inject(&net, frames[0].clone()).await;
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    let mut oks = 0;
    while let Ok(frame) = ctrl_tap.try_recv() {
        if matches!(
            ControlMessage::parse(&frame.payload),
            Ok(ControlMessage::Ok { .. })
        ) {
            oks += 1;
        }
    }
    assert_eq!(oks, 4, "three completion OKs plus one re-OK");
    assert_eq!(net.receiver.counters().duplicate_chunks, expected_duplicates);
}

#[tokio::test(start_paused = true)]
async fn any_arrival_order_reassembles() {
    let mut net = test_net();

    let capacity = chunk_capacity(200);
    let blob = random_blob(185 * 29 + 60, 37); // 30 chunks, short tail
    let mut frames = raw_frames(0x1bad_b002, &blob, capacity);
    frames.shuffle(&mut StdRng::seed_from_u64(42));

    for frame in &frames {
        inject(&net, frame.clone()).await;
    }

    let (_, id, received) = expect_completed(&mut net.events).await;
    assert_eq!(id, 0x1bad_b002);
    assert_eq!(received, blob);
    assert_eq!(net.receiver.counters().duplicate_chunks, 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_transfers_from_one_peer_coexist() {
    let mut net = test_net();

    let capacity = chunk_capacity(200);
    let blob_a = random_blob(600, 51);
    let blob_b = random_blob(900, 53);
    let frames_a = raw_frames(0x0000_00aa, &blob_a, capacity);
    let frames_b = raw_frames(0x0000_00bb, &blob_b, capacity);

    // Interleave the two transfers chunk by chunk.
    let mut order = Vec::new();
    for i in 0..frames_a.len().max(frames_b.len()) {
        if let Some(f) = frames_a.get(i) {
            order.push(f.clone());
        }
        if let Some(f) = frames_b.get(i) {
            order.push(f.clone());
        }
    }
    for frame in order {
        inject(&net, frame).await;
    }

    let first = expect_completed(&mut net.events).await;
    let second = expect_completed(&mut net.events).await;
    let mut done: Vec<(u32, bytes::Bytes)> =
        vec![(first.1, first.2), (second.1, second.2)];
    done.sort_by_key(|(id, _)| *id);
    assert_eq!(done[0].0, 0x0000_00aa);
    assert_eq!(done[0].1, blob_a);
    assert_eq!(done[1].0, 0x0000_00bb);
    assert_eq!(done[1].1, blob_b);
}
