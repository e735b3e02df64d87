//! Adaptive pacing behavior observed end to end, plus the sender-side
//! completion timeout.

use std::time::Duration;

use meshpix_core::payload::CompressMode;
use meshpix_core::wire::Frame;
use meshpix_transport::events::{FailureKind, TransferOutcome};
use meshpix_transport::sender::SendOptions;

use crate::*;

#[tokio::test(start_paused = true)]
async fn lossy_link_raises_the_pace() {
    let mut net = test_net();

    // Roughly one data frame in six never gets its link-layer ack.
    net.mesh.set_drop_filter(|frame| {
        Frame::parse(frame.payload).is_ok() && frame.seq % 6 == 0
    });

    let blob = random_blob(185 * 20, 97);
    let handle = net
        .sender
        .send_blob(
            GALLERY,
            blob.clone(),
            SendOptions {
                chunk_delay_secs: Some(4.0),
                adaptive: Some(true),
                compress: Some(CompressMode::Off),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let stats = match handle.await_completion().await {
        TransferOutcome::Done(stats) => stats,
        TransferOutcome::Failed(kind) => panic!("transfer failed: {kind}"),
    };
    assert!(
        stats.final_delay_secs >= 4.8,
        "delay should rise under loss, was {}",
        stats.final_delay_secs
    );
    assert!(stats.final_delay_secs <= 10.0);
    assert!(stats.retries > 0);

    let (_, _, received) = expect_completed(&mut net.events).await;
    assert_eq!(received, blob);
}

#[tokio::test(start_paused = true)]
async fn clean_link_trims_the_pace() {
    let mut net = test_net();

    let blob = random_blob(185 * 20, 101);
    let handle = net
        .sender
        .send_blob(
            GALLERY,
            blob.clone(),
            SendOptions {
                chunk_delay_secs: Some(4.0),
                adaptive: Some(true),
                compress: Some(CompressMode::Off),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let stats = match handle.await_completion().await {
        TransferOutcome::Done(stats) => stats,
        TransferOutcome::Failed(kind) => panic!("transfer failed: {kind}"),
    };
    assert!(
        stats.final_delay_secs < 4.0,
        "delay should fall on a clean link, was {}",
        stats.final_delay_secs
    );
    assert!(stats.final_delay_secs >= 1.0);
    assert_eq!(stats.retries, 0);

    let (_, _, received) = expect_completed(&mut net.events).await;
    assert_eq!(received, blob);
}

#[tokio::test(start_paused = true)]
async fn fast_mode_holds_the_floor() {
    let mut net = test_net();

    let blob = random_blob(185 * 12, 103);
    let handle = net
        .sender
        .send_blob(
            GALLERY,
            blob.clone(),
            SendOptions {
                fast: true,
                compress: Some(CompressMode::Off),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let stats = match handle.await_completion().await {
        TransferOutcome::Done(stats) => stats,
        TransferOutcome::Failed(kind) => panic!("transfer failed: {kind}"),
    };
    assert_eq!(stats.final_delay_secs, 1.0);
    let _ = expect_completed(&mut net.events).await;
}

#[tokio::test(start_paused = true)]
async fn silent_receiver_times_the_sender_out() {
    let net = test_net();

    // The gallery engine stops draining; chunks still get link acks, but
    // no completion confirmation will ever come back.
    net.receiver.shutdown();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let blob = random_blob(185 * 5, 107);
    let started = tokio::time::Instant::now();
    let handle = net
        .sender
        .send_blob(
            GALLERY,
            blob,
            SendOptions {
                fast: true,
                compress: Some(CompressMode::Off),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcome = handle.await_completion().await;
    assert_eq!(outcome, TransferOutcome::Failed(FailureKind::Timeout));
    // Five fast chunks plus the clamped 60 s completion floor.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(60));
    assert!(elapsed <= Duration::from_secs(90));
}
