//! Base-128 varint length prefix (protobuf-style): little-endian
//! septets, continuation bit set on all but the last byte, up to 5 bytes
//! for a 32-bit length.

use bytes::{BufMut, Bytes, BytesMut};
use weave_core::{ByteDecoder, Cumulation, CodecError};

const MAX_VARINT_BYTES: usize = 5;

/// Returns `(value, bytes_consumed)` peeked from the front of `buf` without
/// advancing it, or `None` if the readable bytes end mid-varint.
fn peek_varint(buf: &Cumulation) -> Result<Option<(u32, usize)>, CodecError> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let Some(byte) = buf.byte_at(i) else {
            return Ok(None);
        };
        let septet = (byte & 0x7F) as u32;
        if i == MAX_VARINT_BYTES - 1 && byte & 0x80 != 0 {
            return Err(CodecError::corrupted("varint longer than 5 bytes"));
        }
        value |= septet << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    unreachable!("loop always returns by the 5th byte")
}

pub struct VarintLengthDecoder;

impl ByteDecoder for VarintLengthDecoder {
    type Item = Bytes;

    fn decode(&mut self, buf: &mut Cumulation, _end_of_stream: bool) -> Result<Option<Bytes>, CodecError> {
        let Some((length, prefix_len)) = peek_varint(buf)? else {
            return Ok(None);
        };
        if length & 0x8000_0000 != 0 {
            return Err(CodecError::corrupted("varint length is negative"));
        }
        let length = length as usize;
        if buf.readable() < prefix_len + length {
            return Ok(None);
        }
        buf.advance(prefix_len);
        Ok(Some(buf.split_frame(length)))
    }
}

pub fn encode_varint(payload: &Bytes) -> Bytes {
    let mut out = BytesMut::with_capacity(MAX_VARINT_BYTES + payload.len());
    let mut value = payload.len() as u32;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            break;
        }
    }
    out.extend_from_slice(payload);
    out.freeze()
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use weave_core::DecodeLoop;

    proptest! {
        /// `decode(encode(payload))` recovers the payload for every length
        /// the 5-byte varint prefix can address.
        #[test]
        fn varint_fidelity(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let payload = Bytes::from(payload);
            let wire = encode_varint(&payload);

            let mut buf = Cumulation::default();
            buf.extend_merge(wire);
            let mut loop_ = DecodeLoop::new(VarintLengthDecoder);
            let mut out = Vec::new();
            loop_.run(&mut buf, false, &mut out).unwrap();
            prop_assert_eq!(out.len(), 1);
            prop_assert_eq!(&out[0], &payload);
        }

        /// The same fidelity property holds when the prefix and payload
        /// arrive split across two fragmented reads.
        #[test]
        fn varint_fidelity_under_fragmentation(
            payload in proptest::collection::vec(any::<u8>(), 1..512),
            split_ratio in 0.0f64..1.0,
        ) {
            let payload = Bytes::from(payload);
            let wire = encode_varint(&payload);
            let split_at = ((wire.len() as f64) * split_ratio) as usize;

            let mut buf = Cumulation::default();
            let mut loop_ = DecodeLoop::new(VarintLengthDecoder);
            let mut out = Vec::new();

            buf.extend_merge(wire.slice(0..split_at));
            loop_.run(&mut buf, false, &mut out).unwrap();
            buf.extend_merge(wire.slice(split_at..));
            loop_.run(&mut buf, false, &mut out).unwrap();

            prop_assert_eq!(out.len(), 1);
            prop_assert_eq!(&out[0], &payload);
        }

        /// Encoding is minimal: the varint prefix never uses more septets
        /// than the value requires (the base-128 encoding's contract).
        #[test]
        fn varint_prefix_is_minimal(len in 0usize..4096) {
            let payload = Bytes::from(vec![0u8; len]);
            let wire = encode_varint(&payload);
            let mut buf = Cumulation::default();
            buf.extend_merge(wire);
            let (decoded_len, prefix_len) = peek_varint(&buf).unwrap().unwrap();
            prop_assert_eq!(decoded_len as usize, len);

            let expected_prefix_len = if len == 0 {
                1
            } else {
                (32 - (len as u32).leading_zeros() as usize).div_ceil(7).max(1)
            };
            prop_assert_eq!(prefix_len, expected_prefix_len);
        }
    }
}
