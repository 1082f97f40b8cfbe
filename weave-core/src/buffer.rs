//! Cumulation: the per-decoder accumulator that turns fragmented inbound
//! reads into a buffer a [`crate::decoder::Decoder`] can slice frames out of.
//!
//! Two cumulator strategies are provided, mirroring the two buffer-growth
//! policies a streaming decoder needs:
//!
//! - [`Cumulation::Merge`] keeps one contiguous [`BytesMut`] and copies
//!   incoming fragments into it, growing (and implicitly compacting,
//!   courtesy of `BytesMut`'s own reuse-the-backing-allocation behaviour)
//!   as needed. This is the default and is right for most framers.
//! - [`Cumulation::Composite`] appends each inbound fragment as its own
//!   zero-copy [`Bytes`] segment instead of copying. Better when fragments
//!   are already the right size and copying them would be wasted work, at
//!   the cost of slightly more expensive random access across segments.
//!
//! Compaction safety (never rewriting bytes a caller still holds a view
//! into) is not something we have to hand-roll: `BytesMut` already refuses
//! to clobber storage that an extracted `Bytes` is still looking at, so
//! handing out frames via [`Cumulation::split_frame`] and continuing to
//! append is always safe. The only discipline left to us is deciding
//! *when* a cumulator is empty enough to drop to the zero-copy adoption of
//! the very first inbound fragment (see [`Cumulation::extend_merge`]).

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

/// Growth policy for a decoder's cumulation buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CumulatorKind {
    /// Copy fragments into one contiguous buffer (the default).
    Merge,
    /// Append fragments as zero-copy segments instead of copying them.
    Composite,
}

/// The accumulator itself. Starts `Empty` and is created lazily on first
/// read.
#[derive(Debug)]
pub enum Cumulation {
    Empty,
    Merge(BytesMut),
    Composite(VecDeque<Bytes>),
}

impl Default for Cumulation {
    fn default() -> Self {
        Self::Empty
    }
}

impl Cumulation {
    /// Bytes available to read without triggering another inbound fragment.
    pub fn readable(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Merge(buf) => buf.remaining(),
            Self::Composite(segments) => segments.iter().map(|s| s.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.readable() == 0
    }

    /// The first contiguous run of readable bytes. For `Merge` this is
    /// everything; for `Composite` it's the front segment only — callers
    /// that need more must fall back to [`Self::byte_at`] /
    /// [`Self::copy_range`].
    pub fn chunk(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Merge(buf) => buf.chunk(),
            Self::Composite(segments) => segments.front().map(|s| &s[..]).unwrap_or(&[]),
        }
    }

    /// Random-access byte read relative to the current reader position.
    /// Works across composite segment boundaries; returns `None` past the
    /// readable tail.
    pub fn byte_at(&self, index: usize) -> Option<u8> {
        match self {
            Self::Empty => None,
            Self::Merge(buf) => buf.chunk().get(index).copied(),
            Self::Composite(segments) => {
                let mut remaining = index;
                for segment in segments {
                    if remaining < segment.len() {
                        return Some(segment[remaining]);
                    }
                    remaining -= segment.len();
                }
                None
            }
        }
    }

    /// Copy out `len` bytes starting at `offset` without consuming them.
    /// Returns `None` if the range is not fully readable.
    pub fn copy_range(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        if offset + len > self.readable() {
            return None;
        }
        match self {
            Self::Empty => if len == 0 { Some(Vec::new()) } else { None },
            Self::Merge(buf) => Some(buf.chunk()[offset..offset + len].to_vec()),
            Self::Composite(_) => {
                let mut out = Vec::with_capacity(len);
                for i in offset..offset + len {
                    out.push(self.byte_at(i)?);
                }
                Some(out)
            }
        }
    }

    /// Drop `n` readable bytes from the front without returning them
    /// (used by discard-mode skipping in the frame decoders).
    pub fn advance(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        match self {
            Self::Empty => {}
            Self::Merge(buf) => buf.advance(n),
            Self::Composite(segments) => {
                let mut remaining = n;
                while remaining > 0 {
                    match segments.front_mut() {
                        None => break,
                        Some(front) if front.len() <= remaining => {
                            remaining -= front.len();
                            segments.pop_front();
                        }
                        Some(front) => {
                            front.advance(remaining);
                            remaining = 0;
                        }
                    }
                }
            }
        }
        self.drop_if_exhausted();
    }

    /// Slice `len` readable bytes off the front as a retained, shared
    /// view (refcount shared with whatever's left in the cumulation, not
    /// copied) and advance past them.
    pub fn split_frame(&mut self, len: usize) -> Bytes {
        debug_assert!(len <= self.readable());
        let frame = match self {
            Self::Empty => Bytes::new(),
            Self::Merge(buf) => buf.split_to(len).freeze(),
            Self::Composite(segments) => {
                if let Some(front) = segments.front_mut() {
                    if front.len() >= len {
                        let frame = front.split_to(len);
                        if front.is_empty() {
                            segments.pop_front();
                        }
                        return frame;
                    }
                }
                // Spans multiple segments: copy once into an owned buffer.
                let mut out = Vec::with_capacity(len);
                let mut remaining = len;
                while remaining > 0 {
                    let front = segments.front_mut().expect("len <= readable() checked above");
                    if front.len() <= remaining {
                        remaining -= front.len();
                        out.extend_from_slice(front);
                        segments.pop_front();
                    } else {
                        out.extend_from_slice(&front[..remaining]);
                        front.advance(remaining);
                        remaining = 0;
                    }
                }
                Bytes::from(out)
            }
        };
        self.drop_if_exhausted();
        frame
    }

    /// Merge-cumulator append: seed the buffer from the first fragment,
    /// otherwise copy into (and grow, via `BytesMut`, which compacts for
    /// us) the existing buffer.
    pub fn extend_merge(&mut self, input: Bytes) {
        match self {
            Self::Empty => {
                *self = Self::Merge(BytesMut::from(&input[..]));
            }
            Self::Merge(buf) => buf.extend_from_slice(&input),
            Self::Composite(_) => {
                let mut merged = BytesMut::with_capacity(self.readable() + input.len());
                merged.extend_from_slice(&self.copy_range(0, self.readable()).unwrap());
                merged.extend_from_slice(&input);
                *self = Self::Merge(merged);
            }
        }
    }

    /// Composite-cumulator append: push the fragment on as its own
    /// zero-copy segment.
    pub fn extend_composite(&mut self, input: Bytes) {
        if input.is_empty() {
            return;
        }
        match self {
            Self::Empty => {
                let mut segments = VecDeque::with_capacity(4);
                segments.push_back(input);
                *self = Self::Composite(segments);
            }
            Self::Composite(segments) => segments.push_back(input),
            Self::Merge(buf) => {
                let mut segments = VecDeque::with_capacity(2);
                segments.push_back(std::mem::take(buf).freeze());
                segments.push_back(input);
                *self = Self::Composite(segments);
            }
        }
    }

    fn drop_if_exhausted(&mut self) {
        if self.readable() == 0 {
            *self = Self::Empty;
        }
    }
}
