pub mod context;
pub mod handler;

pub use context::{AttributeKey, AttributeSlot, BoxFuture, Context, EventLoop, PipelineMessage, TimerHandle, WriteSignal};
pub use handler::{DuplexHandler, InboundHandler, OutboundHandler};
