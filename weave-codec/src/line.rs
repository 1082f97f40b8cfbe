//! Splits on the first line feed, tolerating an optional
//! preceding carriage return, with the same discard-on-overlong-line
//! behavior as the length-field decoder.

use bytes::Bytes;
use weave_core::{ByteDecoder, Cumulation, CodecError};

pub struct LineBasedDecoder {
    max_length: usize,
    strip_delimiter: bool,
    discarding: bool,
    discarded_so_far: usize,
}

impl LineBasedDecoder {
    pub fn new(max_length: usize, strip_delimiter: bool) -> Self {
        Self {
            max_length,
            strip_delimiter,
            discarding: false,
            discarded_so_far: 0,
        }
    }

    /// Index of the first `\n` within the readable bytes, or `None`.
    fn find_newline(buf: &Cumulation, limit: usize) -> Option<usize> {
        (0..limit).find(|&i| buf.byte_at(i) == Some(b'\n'))
    }
}

impl ByteDecoder for LineBasedDecoder {
    type Item = Bytes;

    fn decode(&mut self, buf: &mut Cumulation, _end_of_stream: bool) -> Result<Option<Bytes>, CodecError> {
        let readable = buf.readable();

        match Self::find_newline(buf, readable) {
            Some(eol) => {
                if self.discarding {
                    let line_length = self.discarded_so_far + eol;
                    buf.advance(eol + 1);
                    self.discarding = false;
                    self.discarded_so_far = 0;
                    tracing::debug!(line_length, "finished discarding overlong line");
                    return Err(CodecError::too_long(line_length, self.max_length));
                }

                let delimiter_len = if eol > 0 && buf.byte_at(eol - 1) == Some(b'\r') { 2 } else { 1 };
                let content_len = eol + 1 - delimiter_len;

                if content_len > self.max_length {
                    buf.advance(eol + 1);
                    return Err(CodecError::too_long(content_len, self.max_length));
                }

                let frame = if self.strip_delimiter {
                    let line = buf.split_frame(content_len);
                    buf.advance(delimiter_len);
                    line
                } else {
                    buf.split_frame(eol + 1)
                };
                Ok(Some(frame))
            }
            None => {
                if !self.discarding && readable > self.max_length {
                    self.discarding = true;
                    self.discarded_so_far = readable;
                    buf.advance(readable);
                    tracing::debug!(max = self.max_length, "entering discard mode for overlong line");
                } else if self.discarding {
                    self.discarded_so_far += readable;
                    buf.advance(readable);
                }
                Ok(None)
            }
        }
    }
}
