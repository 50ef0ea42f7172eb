//! Low-level protobuf wire format helpers
//!
//! A minimal hand-rolled codec for the handful of Meshtastic messages this
//! project consumes. Only the wire types the radio actually emits are
//! supported: varint (0), 64-bit (1, skipped), length-delimited (2) and
//! 32-bit (5). Unknown fields are skipped so newer firmware does not break
//! decoding.

use crate::error::{ProtoError, Result};

/// Wire type constants from the protobuf encoding spec
pub const WIRE_VARINT: u8 = 0;
pub const WIRE_FIXED64: u8 = 1;
pub const WIRE_LEN: u8 = 2;
pub const WIRE_FIXED32: u8 = 5;

/// Decode a varint from the front of `data`, returning the value and the
/// number of bytes consumed. Returns `None` on truncation or overflow.
pub fn decode_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut val: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in data.iter().enumerate() {
        val |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Some((val, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
    None
}

/// Encode a value as a protobuf varint
pub fn encode_varint(mut v: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
    buf
}

/// One decoded field value, borrowing length-delimited payloads
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

impl<'a> FieldValue<'a> {
    /// Varint value truncated to u32, the common case in these messages
    pub fn as_u32(&self) -> u32 {
        match self {
            FieldValue::Varint(v) => *v as u32,
            FieldValue::Fixed32(v) => *v,
            _ => 0,
        }
    }

    /// Varint interpreted as a boolean flag
    pub fn as_bool(&self) -> bool {
        matches!(self, FieldValue::Varint(v) if *v != 0)
    }
}

/// Iterator-style reader over a protobuf message body
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Advance to the next field, or `None` at end of input.
    ///
    /// Fields with wire types this reader does not model (groups) produce
    /// `UnsupportedWireType`; truncated input produces `InvalidProtobuf`.
    pub fn next_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }

        let (tag, n) = decode_varint(&self.data[self.pos..])
            .ok_or(ProtoError::InvalidProtobuf("truncated field tag"))?;
        self.pos += n;

        let field_num = (tag >> 3) as u32;
        let wire_type = (tag & 0x07) as u8;

        let value = match wire_type {
            WIRE_VARINT => {
                let (v, n) = decode_varint(&self.data[self.pos..])
                    .ok_or(ProtoError::InvalidProtobuf("truncated varint"))?;
                self.pos += n;
                FieldValue::Varint(v)
            }
            WIRE_FIXED64 => {
                let end = self.pos + 8;
                if end > self.data.len() {
                    return Err(ProtoError::InvalidProtobuf("truncated fixed64"));
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.data[self.pos..end]);
                self.pos = end;
                FieldValue::Fixed64(u64::from_le_bytes(bytes))
            }
            WIRE_LEN => {
                let (len, n) = decode_varint(&self.data[self.pos..])
                    .ok_or(ProtoError::InvalidProtobuf("truncated length prefix"))?;
                self.pos += n;
                let end = self.pos + len as usize;
                if end > self.data.len() {
                    return Err(ProtoError::InvalidProtobuf("field length exceeds buffer"));
                }
                let bytes = &self.data[self.pos..end];
                self.pos = end;
                FieldValue::Bytes(bytes)
            }
            WIRE_FIXED32 => {
                let end = self.pos + 4;
                if end > self.data.len() {
                    return Err(ProtoError::InvalidProtobuf("truncated fixed32"));
                }
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&self.data[self.pos..end]);
                self.pos = end;
                FieldValue::Fixed32(u32::from_le_bytes(bytes))
            }
            other => return Err(ProtoError::UnsupportedWireType(other)),
        };

        Ok(Some((field_num, value)))
    }
}

// ===== Encoder helpers =====

/// Append a field tag
fn put_tag(buf: &mut Vec<u8>, field_num: u32, wire_type: u8) {
    buf.extend_from_slice(&encode_varint(((field_num as u64) << 3) | wire_type as u64));
}

/// Append a varint field
pub fn put_uint32(buf: &mut Vec<u8>, field_num: u32, v: u32) {
    put_tag(buf, field_num, WIRE_VARINT);
    buf.extend_from_slice(&encode_varint(v as u64));
}

/// Append an int32 varint field (negative values sign-extend to ten bytes)
pub fn put_int32(buf: &mut Vec<u8>, field_num: u32, v: i32) {
    put_tag(buf, field_num, WIRE_VARINT);
    buf.extend_from_slice(&encode_varint(v as i64 as u64));
}

/// Append a length-delimited field
pub fn put_bytes(buf: &mut Vec<u8>, field_num: u32, data: &[u8]) {
    put_tag(buf, field_num, WIRE_LEN);
    buf.extend_from_slice(&encode_varint(data.len() as u64));
    buf.extend_from_slice(data);
}

/// Append a string field
pub fn put_string(buf: &mut Vec<u8>, field_num: u32, s: &str) {
    put_bytes(buf, field_num, s.as_bytes());
}

/// Append a fixed32 field (little-endian)
pub fn put_fixed32(buf: &mut Vec<u8>, field_num: u32, v: u32) {
    put_tag(buf, field_num, WIRE_FIXED32);
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append an sfixed32 field
pub fn put_sfixed32(buf: &mut Vec<u8>, field_num: u32, v: i32) {
    put_fixed32(buf, field_num, v as u32);
}

/// Append a float field
pub fn put_float(buf: &mut Vec<u8>, field_num: u32, v: f32) {
    put_fixed32(buf, field_num, v.to_bits());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_vectors() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (300, &[0xac, 0x02]),
            (16384, &[0x80, 0x80, 0x01]),
        ];

        for &(value, bytes) in cases {
            assert_eq!(encode_varint(value), bytes, "encode {}", value);
            let (decoded, n) = decode_varint(bytes).unwrap();
            assert_eq!(decoded, value, "decode {:02x?}", bytes);
            assert_eq!(n, bytes.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        assert!(decode_varint(&[]).is_none());
        assert!(decode_varint(&[0x80]).is_none());
        assert!(decode_varint(&[0x80, 0x80]).is_none());
    }

    #[test]
    fn test_negative_int32_roundtrip() {
        let mut buf = Vec::new();
        put_int32(&mut buf, 13, -20);

        let mut reader = FieldReader::new(&buf);
        let (num, value) = reader.next_field().unwrap().unwrap();
        assert_eq!(num, 13);
        match value {
            FieldValue::Varint(v) => assert_eq!(v as i32, -20),
            other => panic!("wrong wire type: {:?}", other),
        }
    }

    #[test]
    fn test_reader_skips_unknown_fields() {
        let mut buf = Vec::new();
        put_uint32(&mut buf, 1, 42);
        put_fixed32(&mut buf, 99, 0xdeadbeef); // unknown fixed32 field
        put_bytes(&mut buf, 98, b"opaque"); // unknown length-delimited field
        put_uint32(&mut buf, 2, 7);

        let mut reader = FieldReader::new(&buf);
        let mut seen = Vec::new();
        while let Some((num, _)) = reader.next_field().unwrap() {
            seen.push(num);
        }
        assert_eq!(seen, vec![1, 99, 98, 2]);
    }

    #[test]
    fn test_reader_rejects_groups() {
        // Field 1 with wire type 3 (start group)
        let buf = [0x0b];
        let mut reader = FieldReader::new(&buf);
        assert!(matches!(
            reader.next_field(),
            Err(ProtoError::UnsupportedWireType(3))
        ));
    }

    #[test]
    fn test_reader_truncated_length() {
        let mut buf = Vec::new();
        put_tag(&mut buf, 2, WIRE_LEN);
        buf.extend_from_slice(&encode_varint(10));
        buf.extend_from_slice(b"abc"); // declares 10 bytes, provides 3

        let mut reader = FieldReader::new(&buf);
        assert!(matches!(
            reader.next_field(),
            Err(ProtoError::InvalidProtobuf(_))
        ));
    }
}
