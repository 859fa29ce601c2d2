//! Wire codec properties: round-trips, forward compatibility of framing
//! extras, compression transparency and subdocument result ordering.

use mussel::kv::opcode::{Opcode, Status, datatype};
use mussel::kv::ops;
use mussel::kv::subdoc::{self, LookupInSpec};
use mussel::kv::wire::{
    FrameDecoder, RequestFrame, ResponseFrame, encode_response,
};
use proptest::prelude::*;

fn arbitrary_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![
        Just(Opcode::Get),
        Just(Opcode::Upsert),
        Just(Opcode::Insert),
        Just(Opcode::Replace),
        Just(Opcode::Remove),
        Just(Opcode::Increment),
        Just(Opcode::Append),
        Just(Opcode::SubdocMultiLookup),
        Just(Opcode::SubdocMultiMutation),
    ]
}

/// Datatype bits that do not claim compression
fn arbitrary_datatype() -> impl Strategy<Value = u8> {
    prop_oneof![
        Just(datatype::RAW),
        Just(datatype::JSON),
        Just(datatype::XATTR),
        Just(datatype::JSON | datatype::XATTR),
    ]
}

proptest! {
    /// Encoding then decoding a request preserves every logical field.
    #[test]
    fn request_frames_round_trip(
        opcode in arbitrary_opcode(),
        partition in any::<u16>(),
        opaque in any::<u32>(),
        cas in any::<u64>(),
        dt in arbitrary_datatype(),
        extras in proptest::collection::vec(any::<u8>(), 0..24),
        key in proptest::collection::vec(any::<u8>(), 1..64),
        value in proptest::collection::vec(any::<u8>(), 0..256),
        durable in any::<bool>(),
    ) {
        let mut frame = RequestFrame {
            opcode_raw: opcode as u8,
            partition,
            opaque,
            cas,
            datatype: dt,
            extras,
            key,
            value,
            ..Default::default()
        };
        if durable {
            mussel::kv::wire::durability_frame(&mut frame.framing_extras, 0x01, Some(2_000));
        }
        let encoded = frame.encode(false);
        let (decoded, used) = RequestFrame::decode(&encoded).unwrap().unwrap();
        prop_assert_eq!(used, encoded.len());
        prop_assert_eq!(decoded, frame);
    }

    /// Exponential backoff is monotone nondecreasing and clamped.
    #[test]
    fn exponential_backoff_is_monotone(attempts in 0u32..64) {
        let calc = mussel::exponential_backoff(
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(500),
            2.0,
        );
        let current = calc(attempts);
        let next = calc(attempts + 1);
        prop_assert!(next >= current);
        prop_assert!(current >= std::time::Duration::from_millis(1));
        prop_assert!(current <= std::time::Duration::from_millis(500));
    }
}

#[test]
fn compressed_store_decodes_to_the_original_value() {
    let frame = RequestFrame {
        key: b"doc".to_vec(),
        value: vec![b'a'; 512],
        ..RequestFrame::new(Opcode::Upsert)
    };
    let encoded = frame.encode(true);
    // the wire form really is compressed
    assert!(encoded.len() < 512);
    let (decoded, _) = RequestFrame::decode(&encoded).unwrap().unwrap();
    assert_eq!(decoded.value, frame.value);
    assert_eq!(decoded.datatype & datatype::SNAPPY, 0);
}

#[test]
fn get_is_never_compressed() {
    let frame = RequestFrame {
        key: b"doc".to_vec(),
        value: vec![b'a'; 512],
        ..RequestFrame::new(Opcode::Get)
    };
    let encoded = frame.encode(true);
    assert!(encoded.len() > 512);
}

#[test]
fn unknown_response_framing_extras_are_skipped() {
    // frame id 0x9 (unknown, 3 bytes) followed by a server duration frame
    let mut framing = vec![0x93, 0x01, 0x02, 0x03];
    framing.extend_from_slice(&[0x02, 0x00, 0x0a]);
    let response = ResponseFrame {
        opcode_raw: Opcode::Get as u8,
        status_raw: Status::Success as u16,
        opaque: 9,
        cas: 17,
        framing_extras: framing,
        extras: 0u32.to_be_bytes().to_vec(),
        value: b"payload survives".to_vec(),
        ..Default::default()
    };
    let wire = encode_response(&response);
    assert_eq!(wire[0], 0x18, "framing extras force the alt response magic");

    let mut decoder = FrameDecoder::new();
    decoder.extend(&wire);
    let parsed = decoder.next().unwrap().unwrap();
    assert_eq!(parsed.value, b"payload survives");
    assert_eq!(parsed.opaque, 9);
    assert_eq!(parsed.cas, 17);
    let expected = 10f64.powf(1.74) / 2.0;
    assert_eq!(parsed.server_duration_us, Some(expected));
}

#[test]
fn partial_frames_wait_for_more_bytes() {
    let response = ResponseFrame {
        opcode_raw: Opcode::Get as u8,
        status_raw: Status::Success as u16,
        value: b"0123456789".to_vec(),
        ..Default::default()
    };
    let wire = encode_response(&response);
    let mut decoder = FrameDecoder::new();
    for chunk in wire.chunks(5) {
        decoder.extend(chunk);
    }
    let parsed = decoder.next().unwrap().unwrap();
    assert_eq!(parsed.value, b"0123456789");
    assert!(decoder.next().unwrap().is_none());
}

#[test]
fn lookup_results_return_in_caller_order() {
    let mut specs = vec![
        LookupInSpec::get("name"),
        LookupInSpec::get("$document.exptime").xattr(),
        LookupInSpec::get("address"),
    ];
    subdoc::prepare_lookup_specs(&mut specs);
    // on the wire the xattr spec now leads
    assert_eq!(specs[0].path, "$document.exptime");

    // response entries are positional against the reordered specs
    let mut body = Vec::new();
    for value in [&b"300"[..], &b"\"ada\""[..], &b"\"home\""[..]] {
        body.extend_from_slice(&(Status::Success as u16).to_be_bytes());
        body.extend_from_slice(&(value.len() as u32).to_be_bytes());
        body.extend_from_slice(value);
    }
    let frame = ResponseFrame {
        opcode_raw: Opcode::SubdocMultiLookup as u8,
        status_raw: Status::Success as u16,
        value: body,
        ..Default::default()
    };

    let result = ops::parse_lookup_in(&frame, &specs).unwrap();
    assert_eq!(result.fields.len(), 3);
    assert_eq!(result.fields[0].path, "name");
    assert_eq!(result.fields[0].value, b"\"ada\"");
    assert_eq!(result.fields[1].path, "$document.exptime");
    assert_eq!(result.fields[1].value, b"300");
    assert_eq!(result.fields[2].path, "address");
    assert_eq!(result.fields[2].value, b"\"home\"");
}
