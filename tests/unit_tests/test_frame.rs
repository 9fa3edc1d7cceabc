// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use ws_engine_rs::ws::frame::{
    self, Decoded, MAX_CONTROL_PAYLOAD, Opcode, apply_mask,
};

fn decode_one(buf: &[u8]) -> (frame::Frame, usize) {
    match frame::decode(buf) {
        Decoded::Frame { frame, consumed } => (frame, consumed),
        other => panic!("expected a complete frame, got {other:?}"),
    }
}

#[test]
fn test_unmasked_text_roundtrip() {
    let encoded = frame::encode(Opcode::Text, true, false, b"Hello", None);
    // RFC 6455 §5.7 example: a single-frame unmasked text message.
    assert_eq!(
        &encoded[..],
        &hex::decode("810548656c6c6f").expect("hex")[..]
    );
    let (frame, consumed) = decode_one(&encoded);
    assert_eq!(consumed, encoded.len());
    assert!(frame.header.fin);
    assert!(!frame.header.masked);
    assert_eq!(frame.header.opcode, Opcode::Text);
    assert_eq!(frame.header.payload_len, 5);
    assert_eq!(&frame.payload[..], b"Hello");
}

#[test]
fn test_masked_text_roundtrip() {
    let key = [0x37, 0xfa, 0x21, 0x3d];
    let encoded = frame::encode(Opcode::Text, true, false, b"Hello", Some(key));
    // RFC 6455 §5.7 example: the same message, masked.
    assert_eq!(
        &encoded[..],
        &hex::decode("818537fa213d7f9f4d5158").expect("hex")[..]
    );
    let (frame, _) = decode_one(&encoded);
    assert!(frame.header.masked);
    assert_eq!(frame.header.mask_key, key);
    // The decoder hands the payload back unmasked.
    assert_eq!(&frame.payload[..], b"Hello");
}

#[test]
fn test_mask_is_an_involution() {
    let key = [0xde, 0xad, 0xbe, 0xef];
    let mut data = b"some opaque payload".to_vec();
    apply_mask(&mut data, key);
    assert_ne!(&data[..], b"some opaque payload");
    apply_mask(&mut data, key);
    assert_eq!(&data[..], b"some opaque payload");
}

#[test]
fn test_extended_16bit_length() {
    let payload = vec![0xAB; 300];
    let encoded = frame::encode(Opcode::Binary, true, false, &payload, None);
    assert_eq!(encoded[1] & 0x7F, 126);
    assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), 300);
    let (frame, consumed) = decode_one(&encoded);
    assert_eq!(consumed, encoded.len());
    assert_eq!(frame.header.payload_len, 300);
    assert_eq!(frame.payload.len(), 300);
}

#[test]
fn test_extended_64bit_length() {
    let payload = vec![0x42; 70_000];
    let encoded = frame::encode(Opcode::Binary, true, false, &payload, None);
    assert_eq!(encoded[1] & 0x7F, 127);
    let (frame, consumed) = decode_one(&encoded);
    assert_eq!(consumed, encoded.len());
    assert_eq!(frame.header.payload_len, 70_000);
}

#[test]
fn test_partial_inputs_are_partial() {
    let encoded = frame::encode(Opcode::Text, true, false, b"Hello", None);
    for cut in 0..encoded.len() {
        assert!(
            matches!(frame::decode(&encoded[..cut]), Decoded::Partial),
            "prefix of {cut} bytes must be partial"
        );
    }
}

#[test]
fn test_unknown_opcode_is_bad() {
    // Opcode 0x3 is reserved.
    assert!(matches!(frame::decode(&[0x83, 0x00]), Decoded::Bad(_)));
}

#[test]
fn test_fragmented_control_frame_is_bad() {
    // PING with fin=0.
    assert!(matches!(frame::decode(&[0x09, 0x00]), Decoded::Bad(_)));
}

#[test]
fn test_oversized_control_frame_is_bad() {
    // CLOSE with a 126-byte payload needs the 16-bit length form.
    let bad = [0x88u8, 126, 0x00, 126];
    assert!(matches!(frame::decode(&bad), Decoded::Bad(_)));
}

#[test]
fn test_rsv23_are_bad() {
    assert!(matches!(frame::decode(&[0xA1, 0x00]), Decoded::Bad(_)));
    assert!(matches!(frame::decode(&[0x91, 0x00]), Decoded::Bad(_)));
}

#[test]
fn test_close_frame_budget() {
    // An oversized reason is clipped so the frame stays a legal control
    // frame: fin=1 and total size well under 127 bytes.
    let reason = "x".repeat(500);
    let encoded = frame::close(1002, &reason, None);
    assert!(encoded.len() <= 127);
    let (frame, _) = decode_one(&encoded);
    assert!(frame.header.fin);
    assert_eq!(frame.header.opcode, Opcode::Close);
    assert!(frame.header.payload_len <= MAX_CONTROL_PAYLOAD as u64);
    let (code, text) = frame::parse_close(&frame.payload);
    assert_eq!(code, 1002);
    assert_eq!(text.len(), MAX_CONTROL_PAYLOAD - 2);
}

#[test]
fn test_close_roundtrip_code_and_reason() {
    let encoded = frame::close(1000, "bye", None);
    let (frame, _) = decode_one(&encoded);
    let (code, reason) = frame::parse_close(&frame.payload);
    assert_eq!(code, 1000);
    assert_eq!(reason, "bye");
}

#[test]
fn test_ping_pong_echo_payload() {
    let encoded = frame::ping(b"\x01\x02", None);
    let (ping, _) = decode_one(&encoded);
    assert_eq!(ping.header.opcode, Opcode::Ping);

    let encoded = frame::pong(&ping.payload, None);
    let (pong, _) = decode_one(&encoded);
    assert_eq!(pong.header.opcode, Opcode::Pong);
    assert_eq!(&pong.payload[..], b"\x01\x02");
}

#[test]
fn test_two_frames_back_to_back() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&frame::encode(Opcode::Text, true, false, b"one", None));
    buf.extend_from_slice(&frame::encode(Opcode::Binary, true, false, b"two", None));

    let (first, consumed) = decode_one(&buf);
    assert_eq!(&first.payload[..], b"one");
    let (second, rest) = decode_one(&buf[consumed..]);
    assert_eq!(&second.payload[..], b"two");
    assert_eq!(consumed + rest, buf.len());
}

#[test]
fn test_rsv1_survives_roundtrip() {
    let encoded = frame::encode(Opcode::Text, false, true, b"zzzz", None);
    let (frame, _) = decode_one(&encoded);
    assert!(frame.header.rsv[0]);
    assert!(!frame.header.fin);
}

#[test]
fn test_header_len_matches_wire() {
    for (payload_len, expect) in [(0usize, 2usize), (125, 2), (126, 4), (70_000, 10)] {
        let payload = vec![0u8; payload_len];
        let encoded = frame::encode(Opcode::Binary, true, false, &payload, None);
        assert_eq!(encoded.len() - payload_len, expect, "len={payload_len}");
    }
}
