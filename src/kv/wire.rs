// Mussel Key-Value Core — Wire Codec
// Copyright (c) 2024-2026 Mussel Contributors
// Distributed under the MIT software license.

//! Binary frame codec for the data service.
//!
//! Frame layout: 24-byte header followed by
//! `framing_extras ‖ extras ‖ key ‖ value`. All multi-byte header fields are
//! big-endian. The "alt" magics repurpose the key-length field as
//! `(framing_extras_len: u8, key_len: u8)`.

use super::opcode::{Magic, Opcode, Status, datatype, response_frame};
use thiserror::Error;
use tracing::{debug, warn};

pub const HEADER_SIZE: usize = 24;

/// Values shorter than this are never worth compressing
pub const MIN_SIZE_TO_COMPRESS: usize = 32;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid magic byte 0x{0:02x}")]
    BadMagic(u8),
    #[error("frame body length {0} exceeds limit")]
    BodyTooLarge(u32),
    #[error("declared segment lengths exceed body size")]
    SegmentOverflow,
    #[error("snappy datatype bit set but value does not decompress")]
    Decompression,
    #[error("leb128 sequence is truncated or too long")]
    Leb128,
}

/// Hard cap on a single frame body; the server enforces 20 MiB + overhead
pub const MAX_BODY_SIZE: u32 = 21 * 1024 * 1024;

// =============================================================================
// LEB128 COLLECTION-ID PREFIX
// =============================================================================

/// Append the unsigned LEB128 encoding of `value`
pub fn leb128_encode(value: u32, out: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

/// Decode an unsigned LEB128 prefix, returning the value and its width
pub fn leb128_decode(input: &[u8]) -> Result<(u32, usize), WireError> {
    let mut value: u32 = 0;
    for (i, byte) in input.iter().enumerate() {
        if i == 5 {
            return Err(WireError::Leb128);
        }
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(WireError::Leb128)
}

/// Build the on-wire key: LEB128 collection uid prefix plus the logical key.
/// Peers without collection support get the bare key (`uid == None`).
pub fn wire_key(collection_uid: Option<u32>, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 5);
    if let Some(uid) = collection_uid {
        leb128_encode(uid, &mut out);
    }
    out.extend_from_slice(key);
    out
}

// =============================================================================
// FRAMING EXTRAS
// =============================================================================

/// Append one framing-info frame: `(id << 4 | len)` header then the payload.
/// Ids and sizes above 14 would need the escape encoding, which none of the
/// frames the core produces require.
fn push_frame(out: &mut Vec<u8>, frame_id: u8, payload: &[u8]) {
    debug_assert!(frame_id < 0x0f && payload.len() < 0x0f);
    out.push((frame_id << 4) | payload.len() as u8);
    out.extend_from_slice(payload);
}

/// Durability requirement frame: level byte plus optional 16-bit timeout
pub fn durability_frame(out: &mut Vec<u8>, level: u8, timeout_ms: Option<u16>) {
    match timeout_ms {
        Some(ms) => {
            let mut payload = [0u8; 3];
            payload[0] = level;
            payload[1..3].copy_from_slice(&ms.to_be_bytes());
            push_frame(out, super::opcode::request_frame::DURABILITY_REQUIREMENT, &payload);
        }
        None => push_frame(out, super::opcode::request_frame::DURABILITY_REQUIREMENT, &[level]),
    }
}

/// Preserve-TTL frame: id only, zero-length payload
pub fn preserve_ttl_frame(out: &mut Vec<u8>) {
    push_frame(out, super::opcode::request_frame::PRESERVE_TTL, &[]);
}

/// Walk response framing extras. The server duration is decoded from its
/// 16-bit compressed form; unknown frame ids are skipped by advancing the
/// declared size so newer servers stay compatible.
pub fn parse_response_framing_extras(extras: &[u8]) -> Option<f64> {
    let mut server_duration = None;
    let mut offset = 0usize;
    while offset < extras.len() {
        let frame_size = (extras[offset] & 0x0f) as usize;
        let frame_id = extras[offset] >> 4;
        offset += 1;
        if frame_id == response_frame::SERVER_DURATION
            && frame_size == 2
            && extras.len() - offset >= 2
        {
            let encoded = u16::from_be_bytes([extras[offset], extras[offset + 1]]);
            server_duration = Some(f64::from(encoded).powf(1.74) / 2.0);
        } else if frame_id != response_frame::SERVER_DURATION {
            debug!(frame_id, frame_size, "skipping unknown response framing frame");
        }
        offset += frame_size;
    }
    server_duration
}

// =============================================================================
// REQUEST FRAMES
// =============================================================================

/// One request before the session assigns its opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFrame {
    pub opcode_raw: u8,
    pub partition: u16,
    pub opaque: u32,
    pub cas: u64,
    pub datatype: u8,
    pub framing_extras: Vec<u8>,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl RequestFrame {
    pub fn new(opcode: Opcode) -> Self {
        Self { opcode_raw: opcode as u8, ..Default::default() }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode_raw)
    }

    /// Serialize the frame. With `try_compress`, values on store opcodes are
    /// snappy-compressed when that actually shrinks them, and the snappy
    /// datatype bit is set.
    pub fn encode(&self, try_compress: bool) -> Vec<u8> {
        let mut datatype = self.datatype;
        let compressed: Option<Vec<u8>> = if try_compress
            && self.opcode().is_some_and(|op| op.compresses_value())
            && self.value.len() >= MIN_SIZE_TO_COMPRESS
        {
            snap::raw::Encoder::new()
                .compress_vec(&self.value)
                .ok()
                .filter(|packed| packed.len() < self.value.len())
        } else {
            None
        };
        let value: &[u8] = match &compressed {
            Some(packed) => {
                datatype |= datatype::SNAPPY;
                packed
            }
            None => &self.value,
        };

        let body_len =
            self.framing_extras.len() + self.extras.len() + self.key.len() + value.len();
        let mut out = Vec::with_capacity(HEADER_SIZE + body_len);
        if self.framing_extras.is_empty() {
            out.push(Magic::ClientRequest as u8);
            out.push(self.opcode_raw);
            out.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        } else {
            out.push(Magic::AltClientRequest as u8);
            out.push(self.opcode_raw);
            out.push(self.framing_extras.len() as u8);
            out.push(self.key.len() as u8);
        }
        out.push(self.extras.len() as u8);
        out.push(datatype);
        out.extend_from_slice(&self.partition.to_be_bytes());
        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        out.extend_from_slice(&self.opaque.to_be_bytes());
        out.extend_from_slice(&self.cas.to_be_bytes());
        out.extend_from_slice(&self.framing_extras);
        out.extend_from_slice(&self.extras);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(value);
        out
    }

    /// Parse a serialized request, decompressing a snappy value. Used by
    /// in-process test servers and kept in sync with [`encode`].
    ///
    /// [`encode`]: RequestFrame::encode
    pub fn decode(input: &[u8]) -> Result<Option<(RequestFrame, usize)>, WireError> {
        let Some(parts) = split_frame(input, false)? else {
            return Ok(None);
        };
        let FrameParts { header, framing_extras, extras, key, value, consumed } = parts;
        let mut datatype = header.datatype;
        let value = if datatype::is_snappy(datatype) {
            datatype &= !datatype::SNAPPY;
            snap::raw::Decoder::new()
                .decompress_vec(value)
                .map_err(|_| WireError::Decompression)?
        } else {
            value.to_vec()
        };
        Ok(Some((
            RequestFrame {
                opcode_raw: header.opcode_raw,
                partition: header.status_or_partition,
                opaque: header.opaque,
                cas: header.cas,
                datatype,
                framing_extras: framing_extras.to_vec(),
                extras: extras.to_vec(),
                key: key.to_vec(),
                value,
            },
            consumed,
        )))
    }
}

// =============================================================================
// RESPONSE FRAMES
// =============================================================================

/// One parsed response frame.
#[derive(Debug, Clone, Default)]
pub struct ResponseFrame {
    pub opcode_raw: u8,
    pub status_raw: u16,
    pub datatype: u8,
    pub opaque: u32,
    pub cas: u64,
    pub framing_extras: Vec<u8>,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Decoded from the server-duration framing extra, microseconds
    pub server_duration_us: Option<f64>,
}

impl ResponseFrame {
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode_raw)
    }

    /// Hardcoded status, if the code is one the client knows
    pub fn status(&self) -> Option<Status> {
        Status::from_u16(self.status_raw)
    }
}

struct FrameHeader {
    opcode_raw: u8,
    status_or_partition: u16,
    datatype: u8,
    opaque: u32,
    cas: u64,
}

struct FrameParts<'a> {
    header: FrameHeader,
    framing_extras: &'a [u8],
    extras: &'a [u8],
    key: &'a [u8],
    value: &'a [u8],
    consumed: usize,
}

/// Split one frame out of `input`, or return `Ok(None)` if more bytes are
/// needed. `expect_response` selects which pair of magics is legal.
fn split_frame(input: &[u8], expect_response: bool) -> Result<Option<FrameParts<'_>>, WireError> {
    if input.len() < HEADER_SIZE {
        return Ok(None);
    }
    let magic = Magic::from_u8(input[0]).ok_or(WireError::BadMagic(input[0]))?;
    if magic.is_response() != expect_response {
        return Err(WireError::BadMagic(input[0]));
    }
    let alt = matches!(magic, Magic::AltClientRequest | Magic::AltClientResponse);

    let (framing_len, key_len) = if alt {
        (input[2] as usize, input[3] as usize)
    } else {
        (0usize, u16::from_be_bytes([input[2], input[3]]) as usize)
    };
    let extras_len = input[4] as usize;
    let datatype = input[5];
    let status_or_partition = u16::from_be_bytes([input[6], input[7]]);
    let body_len = u32::from_be_bytes([input[8], input[9], input[10], input[11]]);
    if body_len > MAX_BODY_SIZE {
        return Err(WireError::BodyTooLarge(body_len));
    }
    let opaque = u32::from_be_bytes([input[12], input[13], input[14], input[15]]);
    let cas = u64::from_be_bytes([
        input[16], input[17], input[18], input[19], input[20], input[21], input[22], input[23],
    ]);

    let total = HEADER_SIZE + body_len as usize;
    if input.len() < total {
        return Ok(None);
    }
    let body = &input[HEADER_SIZE..total];
    let prefix = framing_len + extras_len + key_len;
    if prefix > body.len() {
        return Err(WireError::SegmentOverflow);
    }
    let (framing_extras, rest) = body.split_at(framing_len);
    let (extras, rest) = rest.split_at(extras_len);
    let (key, value) = rest.split_at(key_len);

    Ok(Some(FrameParts {
        header: FrameHeader { opcode_raw: input[1], status_or_partition, datatype, opaque, cas },
        framing_extras,
        extras,
        key,
        value,
        consumed: total,
    }))
}

/// Incremental response parser. Feed raw socket bytes, pull complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete response frame, decompressing snappy values
    /// and decoding framing extras. `Ok(None)` means more bytes are needed.
    pub fn next(&mut self) -> Result<Option<ResponseFrame>, WireError> {
        let Some(parts) = split_frame(&self.buf, true)? else {
            return Ok(None);
        };
        let FrameParts { header, framing_extras, extras, key, value, consumed } = parts;

        let mut datatype = header.datatype;
        let value = if datatype::is_snappy(datatype) {
            datatype &= !datatype::SNAPPY;
            match snap::raw::Decoder::new().decompress_vec(value) {
                Ok(plain) => plain,
                Err(_) => return Err(WireError::Decompression),
            }
        } else {
            value.to_vec()
        };

        let frame = ResponseFrame {
            opcode_raw: header.opcode_raw,
            status_raw: header.status_or_partition,
            datatype,
            opaque: header.opaque,
            cas: header.cas,
            server_duration_us: parse_response_framing_extras(framing_extras),
            framing_extras: framing_extras.to_vec(),
            extras: extras.to_vec(),
            key: key.to_vec(),
            value,
        };

        self.buf.drain(..consumed);
        if !self.buf.is_empty() && Magic::from_u8(self.buf[0]).is_none() {
            warn!(
                opcode = frame.opcode_raw,
                opaque = frame.opaque,
                next = self.buf[0],
                pending = self.buf.len(),
                "invalid magic after parsed frame, resetting receive buffer"
            );
            self.buf.clear();
        }
        Ok(Some(frame))
    }
}

/// Serialize a response frame; only test servers produce these.
pub fn encode_response(frame: &ResponseFrame) -> Vec<u8> {
    let body_len =
        frame.framing_extras.len() + frame.extras.len() + frame.key.len() + frame.value.len();
    let mut out = Vec::with_capacity(HEADER_SIZE + body_len);
    if frame.framing_extras.is_empty() {
        out.push(Magic::ClientResponse as u8);
        out.push(frame.opcode_raw);
        out.extend_from_slice(&(frame.key.len() as u16).to_be_bytes());
    } else {
        out.push(Magic::AltClientResponse as u8);
        out.push(frame.opcode_raw);
        out.push(frame.framing_extras.len() as u8);
        out.push(frame.key.len() as u8);
    }
    out.push(frame.extras.len() as u8);
    out.push(frame.datatype);
    out.extend_from_slice(&frame.status_raw.to_be_bytes());
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.extend_from_slice(&frame.opaque.to_be_bytes());
    out.extend_from_slice(&frame.cas.to_be_bytes());
    out.extend_from_slice(&frame.framing_extras);
    out.extend_from_slice(&frame.extras);
    out.extend_from_slice(&frame.key);
    out.extend_from_slice(&frame.value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb128_round_trips() {
        for value in [0u32, 1, 0x7f, 0x80, 0x1234, 0xffff_ffff] {
            let mut buf = Vec::new();
            leb128_encode(value, &mut buf);
            let (decoded, used) = leb128_decode(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn leb128_rejects_unterminated() {
        assert!(leb128_decode(&[0x80, 0x80]).is_err());
        assert!(leb128_decode(&[]).is_err());
    }

    #[test]
    fn wire_key_prefixes_collection_uid() {
        assert_eq!(wire_key(None, b"foo"), b"foo");
        assert_eq!(wire_key(Some(0), b"foo"), b"\x00foo");
        assert_eq!(wire_key(Some(0x88), b"k"), [0x88, 0x01, b'k']);
    }

    #[test]
    fn durability_frame_layout() {
        let mut plain = Vec::new();
        durability_frame(&mut plain, 0x01, None);
        assert_eq!(plain, [0x11, 0x01]);

        let mut with_timeout = Vec::new();
        durability_frame(&mut with_timeout, 0x03, Some(0x1234));
        assert_eq!(with_timeout, [0x13, 0x03, 0x12, 0x34]);

        let mut ttl = Vec::new();
        preserve_ttl_frame(&mut ttl);
        assert_eq!(ttl, [0x50]);
    }

    #[test]
    fn server_duration_decodes_and_unknown_frames_skip() {
        // unknown frame id 0x7 with 3 payload bytes, then server duration
        let extras = [0x73, 0xaa, 0xbb, 0xcc, 0x02, 0x00, 0x0a];
        let duration = parse_response_framing_extras(&extras).unwrap();
        assert_eq!(duration, 10f64.powf(1.74) / 2.0);
    }
}
