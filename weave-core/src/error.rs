//! Stable error taxonomy shared by every handler in the pipeline.
//!
//! `CodecError` is the root of the decode/encode side of the tree; handlers
//! that are not codecs (aggregation, pooling) get their own top-level kinds.
//! Every variant carries enough context to be logged and correlated without
//! a round trip back into the buffer that produced it.

use thiserror::Error;

/// Errors raised while turning bytes into frames, or frames into bytes.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A decoder's invariants were violated: bad length field, invalid JSON
    /// preamble, negative varint, etc. Always terminal for the frame.
    #[error("corrupted frame: {0}")]
    CorruptedFrame(String),

    /// A frame declared (or accumulated) a length beyond the configured
    /// maximum. Carries the offending length so callers can log it.
    #[error("frame length {length} exceeds maximum {max}")]
    TooLongFrame { length: usize, max: usize },

    /// A TLS record's content type or version did not look like SSL/TLS.
    #[error("not an SSL/TLS record: {0}")]
    NotSslRecord(String),

    /// Catch-all for a decoder that raised something that isn't one of the
    /// above; the inner error becomes `source()`.
    #[error("decoding failed: {0}")]
    Decoding(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// An encoder rejected a value it was asked to serialize (length
    /// doesn't fit the configured field width, etc).
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// A message was routed to a typed encoder/decoder whose type it does
    /// not match.
    #[error("unsupported message type, expected one of: {expected:?}")]
    UnsupportedMessageType { expected: Vec<&'static str> },
}

impl CodecError {
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::CorruptedFrame(msg.into())
    }

    pub fn too_long(length: usize, max: usize) -> Self {
        Self::TooLongFrame { length, max }
    }

    /// Wrap an arbitrary error as a generic decoding failure, unless it is
    /// already a `CodecError` in which case it passes through unchanged.
    pub fn wrap_decoding(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Decoding(Box::new(err))
    }
}

/// Start-without-terminal, content-without-start, or other state-machine
/// violations in the message aggregator.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("aggregation already in progress, cannot start a new message")]
    AlreadyInProgress,

    #[error("content message received with no aggregation in progress")]
    NoAggregationInProgress,

    /// The oversize path: `should_close` carries the policy's decision
    /// between closing the connection outright and merely surfacing this
    /// as a too-long-frame error to the pipeline.
    #[error("aggregate exceeded max content length {max} bytes")]
    TooLarge { max: usize, should_close: bool },
}

/// The connection ended while a message was only partially received.
#[derive(Debug, Error)]
#[error("channel closed with a message still in flight")]
pub struct PrematureChannelClosure;

/// Errors surfaced by [`crate::pipeline`] consumers of [`crate::codec`] or
/// [`crate::decoder`] that need a single umbrella type for `?`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    PrematureClosure(#[from] PrematureChannelClosure),

    #[error("{0}")]
    Other(String),
}

/// Discriminant-only view of a [`CodecError`], for metrics tags and log
/// fields that must not include message text (which may echo payload
/// bytes back into logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    CorruptedFrame,
    TooLongFrame,
    NotSslRecord,
    Decoding,
    Encoding,
    UnsupportedMessageType,
}

impl CodecError {
    pub fn kind(&self) -> CodecErrorKind {
        match self {
            Self::CorruptedFrame(_) => CodecErrorKind::CorruptedFrame,
            Self::TooLongFrame { .. } => CodecErrorKind::TooLongFrame,
            Self::NotSslRecord(_) => CodecErrorKind::NotSslRecord,
            Self::Decoding(_) => CodecErrorKind::Decoding,
            Self::Encoding(_) => CodecErrorKind::Encoding,
            Self::UnsupportedMessageType { .. } => CodecErrorKind::UnsupportedMessageType,
        }
    }
}
