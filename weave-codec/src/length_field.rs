//! Length-field framing: a decoder that reads an
//! N-byte length prefix somewhere inside the frame and slices out exactly
//! that many bytes, and an encoder that writes the matching prefix.

use bytes::{BufMut, Bytes, BytesMut};
use weave_core::{ByteDecoder, Cumulation, CodecError};

/// Width of the length field itself, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    One,
    Two,
    Three,
    Four,
    Eight,
}

impl FieldWidth {
    fn bytes(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
            Self::Eight => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

fn read_uint(buf: &Cumulation, offset: usize, width: FieldWidth, order: ByteOrder) -> u64 {
    let n = width.bytes();
    let mut value: u64 = 0;
    match order {
        ByteOrder::Big => {
            for i in 0..n {
                value = (value << 8) | buf.byte_at(offset + i).unwrap() as u64;
            }
        }
        ByteOrder::Little => {
            for i in (0..n).rev() {
                value = (value << 8) | buf.byte_at(offset + i).unwrap() as u64;
            }
        }
    }
    value
}

fn write_uint(out: &mut BytesMut, value: u64, width: FieldWidth, order: ByteOrder) {
    let n = width.bytes();
    let bytes_be = value.to_be_bytes();
    let slice = &bytes_be[8 - n..];
    match order {
        ByteOrder::Big => out.put_slice(slice),
        ByteOrder::Little => {
            for &b in slice.iter().rev() {
                out.put_u8(b);
            }
        }
    }
}

/// Configuration for [`LengthFieldDecoder`] / [`LengthFieldEncoder`].
#[derive(Debug, Clone, Copy)]
pub struct LengthFieldConfig {
    pub max_frame: usize,
    pub length_field_offset: usize,
    pub length_field_length: FieldWidth,
    pub length_adjustment: i64,
    pub initial_bytes_to_strip: usize,
    pub byte_order: ByteOrder,
    pub fail_fast: bool,
}

impl LengthFieldConfig {
    fn length_field_end_offset(&self) -> usize {
        self.length_field_offset + self.length_field_length.bytes()
    }
}

/// Reads a length-prefixed frame of arbitrary field width/offset.
pub struct LengthFieldDecoder {
    config: LengthFieldConfig,
    discarding: bool,
    bytes_to_discard: usize,
    too_long_frame_length: usize,
}

impl LengthFieldDecoder {
    pub fn new(config: LengthFieldConfig) -> Self {
        Self {
            config,
            discarding: false,
            bytes_to_discard: 0,
            too_long_frame_length: 0,
        }
    }

    fn fail_if_necessary(&mut self, first_detection: bool) -> Result<(), CodecError> {
        if self.bytes_to_discard == 0 {
            let length = self.too_long_frame_length;
            self.too_long_frame_length = 0;
            self.discarding = false;
            if !self.config.fail_fast || first_detection {
                let err = CodecError::too_long(length, self.config.max_frame);
                tracing::debug!(kind = ?err.kind(), length, "reporting too-long frame");
                return Err(err);
            }
        } else if self.config.fail_fast && first_detection {
            let err = CodecError::too_long(self.too_long_frame_length, self.config.max_frame);
            tracing::debug!(kind = ?err.kind(), length = self.too_long_frame_length, "reporting too-long frame (fail-fast)");
            return Err(err);
        }
        Ok(())
    }
}

impl ByteDecoder for LengthFieldDecoder {
    type Item = Bytes;

    fn decode(&mut self, buf: &mut Cumulation, _end_of_stream: bool) -> Result<Option<Bytes>, CodecError> {
        if self.discarding {
            let skip = self.bytes_to_discard.min(buf.readable());
            buf.advance(skip);
            self.bytes_to_discard -= skip;
            if self.bytes_to_discard == 0 {
                tracing::debug!("finished discarding oversized frame");
            }
            self.fail_if_necessary(false)?;
            return Ok(None);
        }

        let cfg = &self.config;
        if buf.readable() < cfg.length_field_end_offset() {
            return Ok(None);
        }

        let unadjusted = read_uint(buf, cfg.length_field_offset, cfg.length_field_length, cfg.byte_order);
        if matches!(cfg.length_field_length, FieldWidth::Eight) && unadjusted > i64::MAX as u64 {
            return Err(CodecError::corrupted("negative length field value"));
        }

        let end_offset = cfg.length_field_end_offset() as i64;
        let frame_length_signed = unadjusted as i64 + cfg.length_adjustment + end_offset;
        if frame_length_signed < end_offset {
            return Err(CodecError::corrupted(format!(
                "adjusted frame length ({frame_length_signed}) is less than length field end offset ({end_offset})"
            )));
        }
        let frame_length = frame_length_signed as usize;

        if frame_length > cfg.max_frame {
            let readable = buf.readable();
            self.too_long_frame_length = frame_length;
            if frame_length <= readable {
                buf.advance(frame_length);
            } else {
                self.discarding = true;
                self.bytes_to_discard = frame_length - readable;
                buf.advance(readable);
                tracing::debug!(frame_length, max = cfg.max_frame, "entering discard mode for oversized frame");
            }
            self.fail_if_necessary(true)?;
            return Ok(None);
        }

        if buf.readable() < frame_length {
            return Ok(None);
        }

        if cfg.initial_bytes_to_strip > frame_length {
            return Err(CodecError::corrupted(format!(
                "initial_bytes_to_strip ({}) exceeds frame length ({frame_length})",
                cfg.initial_bytes_to_strip
            )));
        }

        buf.advance(cfg.initial_bytes_to_strip);
        let frame = buf.split_frame(frame_length - cfg.initial_bytes_to_strip);
        Ok(Some(frame))
    }
}

/// Writes `length = payload.len() + length_adjustment (+ field
/// width if `include_self`)` followed by the payload, retained (no copy
/// of the caller's bytes — the field is written into its own buffer and
/// the two are concatenated as a zero-copy chain would be on the wire by
/// the transport).
pub struct LengthFieldEncoder {
    pub length_field_length: FieldWidth,
    pub length_adjustment: i64,
    pub byte_order: ByteOrder,
    pub include_length_field_length: bool,
}

impl LengthFieldEncoder {
    pub fn encode(&self, payload: &Bytes) -> Result<Bytes, CodecError> {
        let field_width = self.length_field_length.bytes();
        let mut length = payload.len() as i64 + self.length_adjustment;
        if self.include_length_field_length {
            length += field_width as i64;
        }
        if length < 0 {
            return Err(CodecError::Encoding(format!("computed frame length {length} is negative")));
        }
        let max_for_width: u128 = 1u128 << (field_width * 8).min(127);
        if (length as u128) >= max_for_width {
            return Err(CodecError::Encoding(format!(
                "frame length {length} does not fit in a {field_width}-byte field"
            )));
        }

        let mut out = BytesMut::with_capacity(field_width + payload.len());
        write_uint(&mut out, length as u64, self.length_field_length, self.byte_order);
        out.extend_from_slice(payload);
        Ok(out.freeze())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use weave_core::DecodeLoop;

    fn cfg(max: usize, offset: usize, width: FieldWidth, adj: i64, strip: usize, order: ByteOrder, fail_fast: bool) -> LengthFieldConfig {
        LengthFieldConfig {
            max_frame: max,
            length_field_offset: offset,
            length_field_length: width,
            length_adjustment: adj,
            initial_bytes_to_strip: strip,
            byte_order: order,
            fail_fast,
        }
    }

    fn arb_width() -> impl Strategy<Value = FieldWidth> {
        prop_oneof![
            Just(FieldWidth::One),
            Just(FieldWidth::Two),
            Just(FieldWidth::Three),
            Just(FieldWidth::Four),
        ]
    }

    fn arb_order() -> impl Strategy<Value = ByteOrder> {
        prop_oneof![Just(ByteOrder::Big), Just(ByteOrder::Little)]
    }

    proptest! {
        /// `decode(encode(payload))` is the identity for every valid
        /// width/order/payload-length combination.
        #[test]
        fn length_field_fidelity(
            width in arb_width(),
            order in arb_order(),
            payload in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let payload = Bytes::from(payload);
            let encoder = LengthFieldEncoder {
                length_field_length: width,
                length_adjustment: 0,
                byte_order: order,
                include_length_field_length: false,
            };
            let wire = encoder.encode(&payload).unwrap();

            let mut buf = Cumulation::default();
            buf.extend_merge(wire);
            let config = cfg(1 << 21, 0, width, 0, width.bytes(), order, true);
            let mut loop_ = DecodeLoop::new(LengthFieldDecoder::new(config));
            let mut out = Vec::new();
            loop_.run(&mut buf, false, &mut out).unwrap();
            prop_assert_eq!(out.len(), 1);
            prop_assert_eq!(&out[0], &payload);
        }

        /// The same fidelity property holds even when the wire bytes arrive
        /// split across two fragmented reads at an arbitrary split point.
        #[test]
        fn length_field_fidelity_under_fragmentation(
            order in arb_order(),
            payload in proptest::collection::vec(any::<u8>(), 1..512),
            split_ratio in 0.0f64..1.0,
        ) {
            let width = FieldWidth::Four;
            let payload = Bytes::from(payload);
            let encoder = LengthFieldEncoder {
                length_field_length: width,
                length_adjustment: 0,
                byte_order: order,
                include_length_field_length: false,
            };
            let wire = encoder.encode(&payload).unwrap();
            let split_at = ((wire.len() as f64) * split_ratio) as usize;

            let mut buf = Cumulation::default();
            let config = cfg(1 << 21, 0, width, 0, width.bytes(), order, true);
            let mut loop_ = DecodeLoop::new(LengthFieldDecoder::new(config));
            let mut out = Vec::new();

            buf.extend_merge(wire.slice(0..split_at));
            loop_.run(&mut buf, false, &mut out).unwrap();
            buf.extend_merge(wire.slice(split_at..));
            loop_.run(&mut buf, false, &mut out).unwrap();

            prop_assert_eq!(out.len(), 1);
            prop_assert_eq!(&out[0], &payload);
        }
    }
}
