//! Slices concatenated JSON objects (or, with `stream_array_elements`,
//! individual elements of a top-level array) off a byte stream without a
//! full JSON parse — just brace/bracket depth and string-escape tracking.

use bytes::Bytes;
use weave_core::{ByteDecoder, Cumulation, CodecError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Normal,
    ArrayStream,
    Corrupted,
}

pub struct JsonObjectDecoder {
    max_object_length: usize,
    stream_array_elements: bool,
    state: State,
    open_braces: i32,
    inside_string: bool,
    escape_pending: bool,
    /// How far into the (not-yet-advanced) buffer we've scanned for the
    /// current in-progress object/element.
    scan_pos: usize,
}

fn is_json_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

/// Trim ASCII/JSON whitespace from both ends of `[start, end)` and copy the
/// remainder out as an owned frame.
fn trimmed_slice(buf: &Cumulation, mut start: usize, mut end: usize) -> Bytes {
    while start < end && buf.byte_at(start).map(is_json_whitespace).unwrap_or(false) {
        start += 1;
    }
    while end > start && buf.byte_at(end - 1).map(is_json_whitespace).unwrap_or(false) {
        end -= 1;
    }
    Bytes::from(buf.copy_range(start, end - start).unwrap_or_default())
}

impl JsonObjectDecoder {
    pub fn new(max_object_length: usize, stream_array_elements: bool) -> Self {
        Self {
            max_object_length,
            stream_array_elements,
            state: State::Init,
            open_braces: 0,
            inside_string: false,
            escape_pending: false,
            scan_pos: 0,
        }
    }

    fn reset(&mut self) {
        self.state = State::Init;
        self.open_braces = 0;
        self.inside_string = false;
        self.escape_pending = false;
        self.scan_pos = 0;
    }

    /// Updates string/escape/brace-depth tracking for one non-comma,
    /// non-close byte. Returns the new open-brace delta already applied.
    fn track_byte(&mut self, b: u8) {
        if self.inside_string {
            if self.escape_pending {
                self.escape_pending = false;
            } else if b == b'\\' {
                self.escape_pending = true;
            } else if b == b'"' {
                self.inside_string = false;
            }
            return;
        }
        match b {
            b'"' => self.inside_string = true,
            b'{' | b'[' => self.open_braces += 1,
            b'}' | b']' => self.open_braces -= 1,
            _ => {}
        }
    }
}

impl ByteDecoder for JsonObjectDecoder {
    type Item = Bytes;

    fn decode(&mut self, buf: &mut Cumulation, _end_of_stream: bool) -> Result<Option<Bytes>, CodecError> {
        if buf.readable() > self.max_object_length && self.state != State::Corrupted {
            let len = buf.readable();
            buf.advance(len);
            self.reset();
            let err = CodecError::too_long(len, self.max_object_length);
            tracing::debug!(len, max = self.max_object_length, kind = ?err.kind(), "discarding oversized json value");
            return Err(err);
        }

        loop {
            match self.state {
                State::Corrupted => return Err(CodecError::corrupted("json decoder is in a corrupted state")),

                State::Init => {
                    let Some(b) = buf.byte_at(0) else { return Ok(None) };
                    if is_json_whitespace(b) {
                        buf.advance(1);
                        continue;
                    }
                    match b {
                        b'{' => {
                            self.state = State::Normal;
                            self.open_braces = 1;
                            self.scan_pos = 1;
                        }
                        b'[' if self.stream_array_elements => {
                            buf.advance(1);
                            self.state = State::ArrayStream;
                            self.open_braces = 1;
                            self.scan_pos = 0;
                        }
                        b'[' => {
                            self.state = State::Normal;
                            self.open_braces = 1;
                            self.scan_pos = 1;
                        }
                        _ => {
                            self.state = State::Corrupted;
                            let err = CodecError::corrupted(format!(
                                "expected '{{' or '[' to start a json value, found byte {b:#04x}"
                            ));
                            tracing::debug!(byte = b, kind = ?err.kind(), "json decoder entering corrupted state");
                            return Err(err);
                        }
                    }
                }

                State::Normal => {
                    let Some(b) = buf.byte_at(self.scan_pos) else { return Ok(None) };
                    self.track_byte(b);
                    self.scan_pos += 1;
                    if self.open_braces == 0 {
                        let frame = buf.split_frame(self.scan_pos);
                        self.reset();
                        return Ok(Some(frame));
                    }
                }

                State::ArrayStream => {
                    let Some(b) = buf.byte_at(self.scan_pos) else { return Ok(None) };

                    if !self.inside_string && b == b',' && self.open_braces == 1 {
                        let frame = trimmed_slice(buf, 0, self.scan_pos);
                        buf.advance(self.scan_pos + 1);
                        self.scan_pos = 0;
                        return Ok(Some(frame));
                    }

                    if !self.inside_string && b == b']' {
                        self.open_braces -= 1;
                        if self.open_braces == 0 {
                            let frame = trimmed_slice(buf, 0, self.scan_pos);
                            buf.advance(self.scan_pos + 1);
                            self.reset();
                            if frame.is_empty() {
                                // Trailing comma-less empty array, or we
                                // just closed right after a comma: nothing
                                // left to emit for this call.
                                continue;
                            }
                            return Ok(Some(frame));
                        }
                        self.scan_pos += 1;
                        continue;
                    }

                    self.track_byte(b);
                    self.scan_pos += 1;
                }
            }
        }
    }
}
