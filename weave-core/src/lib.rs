//! Core contracts for the weave pipelined network I/O framework: buffer
//! cumulation, the decoding framework, and the handler/context capability
//! surface that frame decoders, the aggregator, the TLS handler and the
//! connection pool all build on.

pub mod buffer;
pub mod decoder;
pub mod error;
pub mod framing_handler;
pub mod pipeline;

pub use buffer::{Cumulation, CumulatorKind};
pub use decoder::{ByteDecoder, DecodeLoop, DecoderResult, ReplayLoop, ReplayOutcome, ReplayingDecoder};
pub use error::{AggregationError, CodecError, CodecErrorKind, PipelineError, PrematureChannelClosure};
pub use framing_handler::FramingHandler;
