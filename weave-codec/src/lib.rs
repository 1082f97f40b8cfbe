//! Concrete frame decoders/encoders and the message aggregator,
//! built on the decoding framework in `weave_core`.

pub mod aggregator;
pub mod delimiter;
pub mod json;
pub mod length_field;
pub mod line;
pub mod varint;

pub use aggregator::{
    AggregationPolicy, AggregatorHandler, AggregatorOutcome, ConcatBodyPolicy, MessageAggregator,
    OversizePolicy, Part,
};
pub use delimiter::DelimiterDecoder;
pub use json::JsonObjectDecoder;
pub use length_field::{ByteOrder, FieldWidth, LengthFieldConfig, LengthFieldDecoder, LengthFieldEncoder};
pub use line::LineBasedDecoder;
pub use varint::{encode_varint, VarintLengthDecoder};
