//! The decoding framework: cumulate inbound fragments and invoke a
//! decoder until it cannot make further progress, forwarding whatever it
//! produced in order.
//!
//! Two decoder shapes are supported:
//!
//! - [`ByteDecoder`], the common case — `decode` is handed the live
//!   cumulation and may consume a prefix of it by calling
//!   [`Cumulation::split_frame`]/[`Cumulation::advance`] itself. This
//!   mirrors a subclassed `ByteToMessageDecoder.decode(ctx, in, out)`.
//! - [`ReplayingDecoder`] — `decode` gets a read-only view and reports how
//!   many bytes it consumed instead of mutating the buffer directly. This
//!   is the idiomatic Rust replacement for "signal replay by throwing":
//!   since nothing is mutated until the decoder is sure it has a complete
//!   frame, there is never anything to roll back.

use std::sync::Arc;

use crate::buffer::Cumulation;
use crate::error::CodecError;

/// Tri-state result attached to a partially decoded message, e.g. so an
/// aggregator downstream can tell a decoder gave up on a frame instead of
/// claiming it completed normally.
#[derive(Debug, Clone)]
pub enum DecoderResult {
    Unfinished,
    Success,
    Failure(Arc<CodecError>),
}

impl DecoderResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

/// A decoder that consumes directly from the live cumulation.
///
/// Returning `Ok(None)` means "not enough data yet, call me again once
/// more bytes arrive" and must leave the cumulation completely untouched
/// (the decode loop turns any decrease in `readable()` paired with no
/// output into another immediate call, so touching the buffer without
/// producing anything is only valid when it genuinely is progress, e.g.
/// skipping bytes in discard mode).
pub trait ByteDecoder: Send {
    type Item: Send + Sync + 'static;

    fn decode(
        &mut self,
        buf: &mut Cumulation,
        end_of_stream: bool,
    ) -> Result<Option<Self::Item>, CodecError>;
}

/// Drives a [`ByteDecoder`] over a [`Cumulation`], enforcing the progress
/// invariant: every call either shrinks the buffer, grows
/// the output, or the loop stops and waits for more bytes; a decoder that
/// produces something while leaving the buffer untouched is a bug, not a
/// silent no-op.
pub struct DecodeLoop<D: ByteDecoder> {
    decoder: D,
    /// Stop after the first batch of output instead of draining the
    /// cumulation completely in one `on_read`.
    pub single_decode: bool,
}

impl<D: ByteDecoder> DecodeLoop<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            single_decode: false,
        }
    }

    pub fn decoder_mut(&mut self) -> &mut D {
        &mut self.decoder
    }

    /// Run the decode loop once, appending any produced items to `out` in
    /// order. Returns the number of items produced.
    pub fn run(
        &mut self,
        buf: &mut Cumulation,
        end_of_stream: bool,
        out: &mut Vec<D::Item>,
    ) -> Result<usize, CodecError> {
        let produced_at_start = out.len();
        loop {
            let old_readable = buf.readable();
            let before_len = out.len();

            match self.decoder.decode(buf, end_of_stream) {
                Ok(Some(item)) => out.push(item),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "decode loop terminated by decoder error");
                    return Err(e);
                }
            }

            let produced = out.len() > before_len;
            let consumed = buf.readable() < old_readable;
            tracing::trace!(
                old_readable,
                readable = buf.readable(),
                produced,
                "decode call returned"
            );

            match (produced, consumed) {
                (false, false) => break, // genuinely need more data
                (false, true) => continue, // discard-mode progress, keep going
                (true, true) => {
                    if self.single_decode {
                        break;
                    }
                }
                (true, false) => {
                    return Err(CodecError::corrupted(
                        "decoder consumed nothing but produced a message",
                    ));
                }
            }

            if end_of_stream && buf.is_empty() {
                break;
            }
        }
        Ok(out.len() - produced_at_start)
    }
}

/// Outcome of one [`ReplayingDecoder::decode`] call.
pub enum ReplayOutcome<T> {
    /// Produced one item after consuming `consumed` bytes from the front
    /// of the buffer. `consumed` must be > 0.
    Produced { item: T, consumed: usize },
    /// Not enough data this pass; nothing was consumed.
    NeedMoreData,
}

/// A decoder that only ever *reads* the cumulation and reports how much
/// to consume, instead of mutating it mid-parse. See the module docs for
/// why this replaces the throw-to-replay pattern outright.
pub trait ReplayingDecoder: Send {
    type Item: Send + Sync + 'static;

    fn decode(
        &mut self,
        buf: &Cumulation,
        end_of_stream: bool,
    ) -> Result<ReplayOutcome<Self::Item>, CodecError>;
}

pub struct ReplayLoop<D: ReplayingDecoder> {
    decoder: D,
    pub single_decode: bool,
}

impl<D: ReplayingDecoder> ReplayLoop<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            single_decode: false,
        }
    }

    pub fn decoder_mut(&mut self) -> &mut D {
        &mut self.decoder
    }

    pub fn run(
        &mut self,
        buf: &mut Cumulation,
        end_of_stream: bool,
        out: &mut Vec<D::Item>,
    ) -> Result<usize, CodecError> {
        let produced_at_start = out.len();
        loop {
            match self.decoder.decode(buf, end_of_stream)? {
                ReplayOutcome::Produced { item, consumed } => {
                    if consumed == 0 {
                        return Err(CodecError::corrupted(
                            "replaying decoder produced an item without consuming any bytes",
                        ));
                    }
                    tracing::trace!(consumed, "replaying decoder produced an item");
                    buf.advance(consumed);
                    out.push(item);
                    if self.single_decode {
                        break;
                    }
                }
                ReplayOutcome::NeedMoreData => break,
            }
            if end_of_stream && buf.is_empty() {
                break;
            }
        }
        Ok(out.len() - produced_at_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Trivial decoder that splits off 4-byte chunks — enough to exercise
    /// the loop's stop conditions without pulling in a real framer.
    struct FourByteChunks;

    impl ByteDecoder for FourByteChunks {
        type Item = Vec<u8>;

        fn decode(
            &mut self,
            buf: &mut Cumulation,
            _end_of_stream: bool,
        ) -> Result<Option<Self::Item>, CodecError> {
            if buf.readable() < 4 {
                return Ok(None);
            }
            Ok(Some(buf.split_frame(4).to_vec()))
        }
    }

    #[test]
    fn drains_every_full_chunk_in_one_pass() {
        let mut buf = Cumulation::default();
        buf.extend_merge(bytes::Bytes::from_static(b"aaaabbbbcccc"));
        let mut loop_ = DecodeLoop::new(FourByteChunks);
        let mut out = Vec::new();
        let n = loop_.run(&mut buf, false, &mut out).unwrap();
        assert_eq!(n, 3);
        assert_eq!(out, vec![b"aaaa".to_vec(), b"bbbb".to_vec(), b"cccc".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn stops_and_waits_when_data_is_short() {
        let mut buf = Cumulation::default();
        buf.extend_merge(bytes::Bytes::from_static(b"aaaabb"));
        let mut loop_ = DecodeLoop::new(FourByteChunks);
        let mut out = Vec::new();
        let n = loop_.run(&mut buf, false, &mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf.readable(), 2);
    }

    struct ProducesWithoutConsuming;
    impl ByteDecoder for ProducesWithoutConsuming {
        type Item = ();
        fn decode(
            &mut self,
            _buf: &mut Cumulation,
            _end_of_stream: bool,
        ) -> Result<Option<Self::Item>, CodecError> {
            Ok(Some(()))
        }
    }

    #[test]
    fn producing_without_consuming_is_an_error() {
        let mut buf = Cumulation::default();
        buf.extend_merge(bytes::Bytes::from_static(b"x"));
        let mut loop_ = DecodeLoop::new(ProducesWithoutConsuming);
        let mut out = Vec::new();
        let err = loop_.run(&mut buf, false, &mut out).unwrap_err();
        assert!(matches!(err, CodecError::CorruptedFrame(_)));
    }

    struct LengthPrefixedReplay;
    impl ReplayingDecoder for LengthPrefixedReplay {
        type Item = Vec<u8>;
        fn decode(
            &mut self,
            buf: &Cumulation,
            _end_of_stream: bool,
        ) -> Result<ReplayOutcome<Self::Item>, CodecError> {
            if buf.readable() < 1 {
                return Ok(ReplayOutcome::NeedMoreData);
            }
            let len = buf.byte_at(0).unwrap() as usize;
            if buf.readable() < 1 + len {
                return Ok(ReplayOutcome::NeedMoreData);
            }
            let item = buf.copy_range(1, len).unwrap();
            Ok(ReplayOutcome::Produced {
                item,
                consumed: 1 + len,
            })
        }
    }

    #[test]
    fn replaying_decoder_waits_without_consuming_then_catches_up() {
        let mut buf = Cumulation::default();
        buf.extend_merge(bytes::Bytes::from_static(b"\x05hel"));
        let mut loop_ = ReplayLoop::new(LengthPrefixedReplay);
        let mut out: Vec<Vec<u8>> = Vec::new();
        let n = loop_.run(&mut buf, false, &mut out).unwrap();
        assert_eq!(n, 0);
        assert_eq!(buf.readable(), 4, "nothing consumed while waiting for more data");

        buf.extend_merge(bytes::Bytes::from_static(b"lo"));
        let n = loop_.run(&mut buf, false, &mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0], b"hello");
        assert!(buf.is_empty());
    }
}
