//! Property-based tests for the wire codec, control grammar, and payload
//! encoding.

#![cfg(test)]

use bytes::Bytes;
use proptest::prelude::*;

use crate::control::{req_batches, ControlMessage};
use crate::payload::{checksum, decode_payload, encode_payload, CompressMode};
use crate::wire::{chunk_capacity, chunk_count, Frame, HEADER_LEN, MAX_FRAME, MAX_TOTAL_SIZE};

// =============================================================================
// Arbitrary Generators
// =============================================================================

prop_compose! {
    fn arb_frame()(
        transfer_id in any::<u32>(),
        total_chunks in 1u8..=255,
        compressed in any::<bool>(),
        crc32 in any::<u32>(),
        total_size in 1u32..=MAX_TOTAL_SIZE,
        payload in prop::collection::vec(any::<u8>(), 0..=(MAX_FRAME - HEADER_LEN)),
    )(
        chunk_index in 0..total_chunks,
        transfer_id in Just(transfer_id),
        total_chunks in Just(total_chunks),
        compressed in Just(compressed),
        crc32 in Just(crc32),
        total_size in Just(total_size),
        payload in Just(payload),
    ) -> Frame {
        Frame {
            transfer_id,
            total_chunks,
            chunk_index,
            compressed,
            crc32,
            total_size,
            payload: Bytes::from(payload),
        }
    }
}

fn arb_control() -> impl Strategy<Value = ControlMessage> {
    let indices = prop::collection::vec(any::<u8>(), 1..=40);
    prop_oneof![
        any::<u32>().prop_map(|transfer_id| ControlMessage::Ok { transfer_id }),
        (any::<u32>(), indices.clone())
            .prop_map(|(transfer_id, indices)| ControlMessage::Req {
                transfer_id,
                indices
            }),
        (any::<u32>(), indices).prop_map(|(transfer_id, indices)| ControlMessage::Ack {
            transfer_id,
            indices
        }),
    ]
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn frame_encode_parse_round_trip(frame in arb_frame()) {
        let bytes = frame.encode().unwrap();
        let back = Frame::parse(&bytes).unwrap();
        prop_assert_eq!(back, frame);
    }

    #[test]
    fn frame_parse_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..400)) {
        let _ = Frame::parse(&bytes);
    }

    #[test]
    fn control_encode_parse_round_trip(msg in arb_control()) {
        let wire = msg.encode();
        let back = ControlMessage::parse(wire.as_bytes()).unwrap();
        prop_assert_eq!(back, msg);
    }

    #[test]
    fn control_parse_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..400)) {
        let _ = ControlMessage::parse(&bytes);
    }

    #[test]
    fn req_batches_always_fit_one_frame(
        transfer_id in any::<u32>(),
        missing in prop::collection::vec(any::<u8>(), 1..=255),
    ) {
        for batch in req_batches(transfer_id, &missing) {
            prop_assert!(batch.encode().len() <= MAX_FRAME);
        }
    }

    #[test]
    fn payload_round_trip(
        blob in prop::collection::vec(any::<u8>(), 1..=8192),
        auto in any::<bool>(),
    ) {
        let mode = if auto { CompressMode::Auto } else { CompressMode::Off };
        let encoded = encode_payload(&blob, mode);
        prop_assert_eq!(encoded.crc, checksum(&encoded.data));
        let back = decode_payload(&encoded.data, encoded.compressed, blob.len()).unwrap();
        prop_assert_eq!(back, blob);
    }

    #[test]
    fn chunk_count_covers_payload(
        total_size in 1usize..=65_535,
        chunk_size in (HEADER_LEN + 1)..=MAX_FRAME,
    ) {
        let capacity = chunk_capacity(chunk_size);
        let count = chunk_count(total_size, capacity);
        prop_assert!(count * capacity >= total_size);
        prop_assert!((count - 1) * capacity < total_size);
    }
}
