//! Binary codec tests: framing, frame extras, collection prefixes

use std::collections::HashSet;
use std::time::Duration;

use cellar_client::binary::codec::Codec;
use cellar_client::binary::opcode::{HelloFeature, Magic, Opcode, datatype};
use cellar_client::binary::packet::{DurabilityFrame, Packet};
use cellar_client::binary::{DurabilityLevel, leb128};
use cellar_client::error::Error;
use pretty_assertions::assert_eq;

fn codec_with(features: &[HelloFeature]) -> Codec {
    Codec::new(HashSet::from_iter(features.iter().copied()))
}

fn sample_request() -> Packet {
    let mut packet = Packet::request(Opcode::Set);
    packet.vbucket = 57;
    packet.opaque = 0xdead_beef;
    packet.cas = 0x0102_0304_0506_0708;
    packet.datatype = datatype::JSON;
    packet.extras = vec![0, 0, 0, 1, 0, 0, 0, 2];
    packet.key = b"airline_10".to_vec();
    packet.value = br#"{"name":"40-Mile Air"}"#.to_vec();
    packet
}

#[test]
fn classic_request_round_trips() {
    let codec = Codec::default();
    let packet = sample_request();
    let bytes = codec.encode_packet(&packet).unwrap();
    assert_eq!(bytes[0], 0x80);
    assert_eq!(bytes.len(), 24 + 8 + 10 + 22);

    let (decoded, consumed) = codec.decode_packet(&bytes).unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(decoded, packet);
}

#[test]
fn header_fields_are_big_endian() {
    let codec = Codec::default();
    let bytes = codec.encode_packet(&sample_request()).unwrap();
    // vbucket 57 at offset 6, opaque at 12, cas at 16
    assert_eq!(&bytes[6..8], &[0x00, 0x39]);
    assert_eq!(&bytes[12..16], &[0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(&bytes[16..24], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
}

#[test]
fn decode_reports_need_more_data() {
    let codec = Codec::default();
    let bytes = codec.encode_packet(&sample_request()).unwrap();
    assert_eq!(codec.decode_packet(&bytes[..10]).unwrap_err(), Error::NeedMoreData);
    assert_eq!(codec.decode_packet(&bytes[..30]).unwrap_err(), Error::NeedMoreData);
    assert_eq!(codec.decode_packet(&[]).unwrap_err(), Error::EndOfStream);
}

#[test]
fn unknown_magic_is_a_protocol_error() {
    let codec = Codec::default();
    let mut bytes = codec.encode_packet(&sample_request()).unwrap();
    bytes[0] = 0x42;
    assert!(matches!(codec.decode_packet(&bytes), Err(Error::ProtocolError(_))));
}

#[test]
fn collection_id_becomes_leb128_key_prefix() {
    let codec = codec_with(&[HelloFeature::Collections]);
    let mut packet = Packet::request(Opcode::Get);
    packet.key = b"doc".to_vec();
    packet.collection_id = 0x2a;
    let bytes = codec.encode_packet(&packet).unwrap();
    // key length grew by one prefix byte, and the prefix is 0x2a
    assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 4);
    assert_eq!(bytes[24], 0x2a);

    let (decoded, _) = codec.decode_packet(&bytes).unwrap();
    assert_eq!(decoded.collection_id, 0x2a);
    assert_eq!(decoded.key, b"doc");
}

#[test]
fn wide_collection_ids_round_trip() {
    let codec = codec_with(&[HelloFeature::Collections]);
    for collection_id in [0u32, 1, 127, 128, 0xffff, 0xffff_fffd] {
        let mut packet = Packet::request(Opcode::Get);
        packet.key = b"k".to_vec();
        packet.collection_id = collection_id;
        let bytes = codec.encode_packet(&packet).unwrap();
        let (decoded, _) = codec.decode_packet(&bytes).unwrap();
        assert_eq!(decoded.collection_id, collection_id);
        assert_eq!(decoded.key, b"k");
    }
}

#[test]
fn empty_key_takes_no_collection_prefix() {
    let codec = codec_with(&[HelloFeature::Collections]);
    let mut packet = Packet::request(Opcode::Get);
    packet.collection_id = 0x2a;
    let bytes = codec.encode_packet(&packet).unwrap();
    assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 0);
}

#[test]
fn get_random_key_carries_collection_id_in_extras() {
    let codec = codec_with(&[HelloFeature::Collections]);
    let mut packet = Packet::request(Opcode::GetRandomKey);
    packet.collection_id = 0x0102_0304;
    let bytes = codec.encode_packet(&packet).unwrap();
    // ext_len 4, and the extras are plain big-endian, not leb128
    assert_eq!(bytes[4], 4);
    assert_eq!(&bytes[24..28], &[0x01, 0x02, 0x03, 0x04]);
}

#[test]
fn collection_id_on_non_collection_opcode_is_rejected() {
    let codec = codec_with(&[HelloFeature::Collections]);
    let mut packet = Packet::request(Opcode::Noop);
    packet.collection_id = 9;
    assert!(matches!(codec.encode_packet(&packet), Err(Error::InvalidArgument(_))));
}

#[test]
fn observe_is_unsupported_with_collections() {
    let codec = codec_with(&[HelloFeature::Collections]);
    let packet = Packet::request(Opcode::Observe);
    assert!(matches!(codec.encode_packet(&packet), Err(Error::UnsupportedOperation(_))));
}

#[test]
fn frames_upgrade_magic_to_alt_form() {
    let codec = codec_with(&[HelloFeature::AltRequestSupport, HelloFeature::SyncReplication]);
    let mut packet = Packet::request(Opcode::Set);
    packet.key = b"k".to_vec();
    packet.durability = Some(DurabilityFrame {
        level: DurabilityLevel::Majority,
        timeout: Some(Duration::from_millis(800)),
    });
    let bytes = codec.encode_packet(&packet).unwrap();
    assert_eq!(bytes[0], Magic::AltClientRequest as u8);
    // alt form: byte 2 frame length, byte 3 key length
    assert_eq!(bytes[2], 4);
    assert_eq!(bytes[3], 1);

    let (decoded, _) = codec.decode_packet(&bytes).unwrap();
    let durability = decoded.durability.unwrap();
    assert_eq!(durability.level, DurabilityLevel::Majority);
    assert_eq!(durability.timeout, Some(Duration::from_millis(800)));
}

#[test]
fn frames_without_alt_support_fail() {
    let codec = codec_with(&[HelloFeature::SyncReplication]);
    let mut packet = Packet::request(Opcode::Set);
    packet.durability =
        Some(DurabilityFrame { level: DurabilityLevel::Majority, timeout: None });
    assert!(matches!(codec.encode_packet(&packet), Err(Error::UnsupportedOperation(_))));
}

#[test]
fn durability_without_feature_fails() {
    let codec = codec_with(&[HelloFeature::AltRequestSupport]);
    let mut packet = Packet::request(Opcode::Set);
    packet.durability =
        Some(DurabilityFrame { level: DurabilityLevel::Majority, timeout: None });
    assert!(matches!(codec.encode_packet(&packet), Err(Error::FeatureNotAvailable(_))));
}

#[test]
fn preserve_expiry_requires_feature() {
    let codec = codec_with(&[HelloFeature::AltRequestSupport]);
    let mut packet = Packet::request(Opcode::Set);
    packet.preserve_expiry = true;
    assert!(matches!(codec.encode_packet(&packet), Err(Error::FeatureNotAvailable(_))));

    let codec = codec_with(&[HelloFeature::AltRequestSupport, HelloFeature::PreserveTtl]);
    let bytes = codec.encode_packet(&packet).unwrap();
    let (decoded, _) = codec.decode_packet(&bytes).unwrap();
    assert!(decoded.preserve_expiry);
}

#[test]
fn long_impersonation_frames_use_the_length_escape() {
    let codec = codec_with(&[HelloFeature::AltRequestSupport]);
    let user = vec![b'u'; 40];
    let mut packet = Packet::request(Opcode::Get);
    packet.user_impersonation = Some(user.clone());
    let bytes = codec.encode_packet(&packet).unwrap();
    // frame header: type 4, escaped length 15 + (40 - 15)
    assert_eq!(bytes[24], 0x4f);
    assert_eq!(bytes[25], 25);

    let (decoded, _) = codec.decode_packet(&bytes).unwrap();
    assert_eq!(decoded.user_impersonation, Some(user));
}

#[test]
fn requests_with_status_and_responses_with_vbucket_are_invalid() {
    let codec = Codec::default();
    let mut request = Packet::request(Opcode::Get);
    request.status = 1;
    assert!(matches!(codec.encode_packet(&request), Err(Error::InvalidArgument(_))));

    let mut response = Packet::response(Opcode::Get);
    response.vbucket = 1;
    assert!(matches!(codec.encode_packet(&response), Err(Error::InvalidArgument(_))));
}

#[test]
fn unknown_response_frames_are_preserved() {
    let codec = Codec::default();
    // hand-build an alt response with frame type 7 (unassigned), length 1
    let mut wire = vec![
        0x18, 0x00, // alt response magic, opcode get
        0x02, 0x00, // frames len 2, key len 0
        0x00, 0x00, // ext len, datatype
        0x00, 0x00, // status
        0x00, 0x00, 0x00, 0x02, // body len
        0x00, 0x00, 0x00, 0x01, // opaque
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // cas
    ];
    wire.extend_from_slice(&[0x71, 0xaa]);
    let (decoded, _) = codec.decode_packet(&wire).unwrap();
    assert_eq!(decoded.unsupported_frames.len(), 1);
    assert_eq!(decoded.unsupported_frames[0].frame_type, 7);
    assert_eq!(decoded.unsupported_frames[0].data, vec![0xaa]);
}

#[test]
fn snappy_responses_are_transparently_decompressed() {
    let codec = codec_with(&[HelloFeature::Snappy]);
    let body = b"a body that compresses fine, a body that compresses fine".repeat(4);
    let compressed = snap_compress(&body);

    let mut response = Packet::response(Opcode::Get);
    response.datatype = datatype::JSON | datatype::SNAPPY;
    response.value = compressed;
    let bytes = codec.encode_packet(&response).unwrap();
    let (decoded, _) = codec.decode_packet(&bytes).unwrap();
    assert_eq!(decoded.value, body);
    assert_eq!(decoded.datatype & datatype::SNAPPY, 0);
}

#[test]
fn compression_is_skipped_when_it_does_not_pay() {
    let codec = codec_with(&[HelloFeature::Snappy]);
    assert!(codec.maybe_compress(b"tiny").is_none());
    let redundant = b"abcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcdabcd".repeat(16);
    let compressed = codec.maybe_compress(&redundant).unwrap();
    assert!((compressed.len() as f64) < redundant.len() as f64 * 0.83);
}

#[test]
fn leb128_encode_decode_is_identity() {
    for value in 0u32..=300 {
        let encoded = leb128::encode(u64::from(value));
        let (decoded, consumed) = leb128::decode(&encoded).unwrap();
        assert_eq!(decoded, u64::from(value));
        assert_eq!(consumed, encoded.len());
    }
}

fn snap_compress(data: &[u8]) -> Vec<u8> {
    // mirror of the codec's compressor, used to build test fixtures
    snap_raw_compress(data)
}

fn snap_raw_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = snap::raw::Encoder::new();
    encoder.compress_vec(data).unwrap()
}
