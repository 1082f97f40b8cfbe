//! The external pipeline capability: what a handler is allowed to assume
//! about the channel and event loop it
//! runs on. Concrete transports (TCP, in-memory test doubles, …) implement
//! these; nothing in `weave-core` schedules I/O itself.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;

use crate::error::PipelineError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A value delivered through the pipeline: either raw bytes (before any
/// framer has run) or a framer's fully decoded message.
#[derive(Debug, Clone)]
pub enum PipelineMessage {
    Bytes(Bytes),
    /// An opaque application message, type-erased behind `Any` so generic
    /// handlers can pass arbitrary frame types downstream.
    Message(std::sync::Arc<dyn std::any::Any + Send + Sync>),
}

impl PipelineMessage {
    pub fn message<T: Send + Sync + 'static>(value: T) -> Self {
        Self::Message(std::sync::Arc::new(value))
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<std::sync::Arc<T>> {
        match self {
            Self::Message(any) => any.clone().downcast::<T>().ok(),
            Self::Bytes(_) => None,
        }
    }
}

/// Feedback from a write call: outbound writes observe FIFO semantics per
/// channel and surface whether the caller should slow down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSignal {
    Accepted,
    /// Accepted, but the outbound buffer is now above its high watermark;
    /// the caller should stop producing until writability flips back.
    AcceptedUnderPressure,
    Rejected,
}

/// A single-threaded, cooperative scheduling handle for one connection.
/// Every mutation to handler-local state must happen while `in_loop()` is
/// true; cross-thread callers must `execute`/`schedule` onto it first.
pub trait EventLoop: Send + Sync {
    fn in_loop(&self) -> bool;
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
    fn schedule(&self, task: Box<dyn FnOnce() + Send>, delay: Duration) -> Box<dyn TimerHandle>;
}

/// A handle to a scheduled timer; dropping it does not cancel the timer,
/// `cancel()` must be called explicitly (this mirrors the pool's "cancel
/// its timer" requirement on release/timeout).
pub trait TimerHandle: Send + Sync {
    fn cancel(&self);
}

/// Per-connection capability surface handed to every handler callback.
pub trait Context: Send + Sync {
    fn event_loop(&self) -> &dyn EventLoop;

    /// Continue propagating a decoded/raw message further down the
    /// inbound chain.
    fn fire_inbound(&self, msg: PipelineMessage);

    fn fire_inbound_complete(&self);

    fn fire_user_event(&self, event: std::sync::Arc<dyn std::any::Any + Send + Sync>);

    fn fire_exception(&self, err: PipelineError);

    /// Ask the transport for another read (used when auto-read is off and
    /// a decoder produced nothing on the last pass).
    fn read(&self);

    fn write_async(&self, msg: PipelineMessage) -> BoxFuture<'static, Result<(), PipelineError>>;

    fn write_and_flush(
        &self,
        msg: PipelineMessage,
    ) -> BoxFuture<'static, Result<(), PipelineError>>;

    fn flush(&self);

    fn close_async(&self) -> BoxFuture<'static, Result<(), PipelineError>>;

    /// A thread-safe get/set/clear slot, keyed by a typed attribute — used
    /// by the connection pool to tag a channel with its owning pool.
    fn attribute(&self, key: AttributeKey) -> &dyn AttributeSlot;
}

/// Opaque key identifying a per-channel attribute slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeKey(pub &'static str);

pub trait AttributeSlot: Send + Sync {
    fn get(&self) -> Option<std::sync::Arc<dyn std::any::Any + Send + Sync>>;
    fn set(&self, value: std::sync::Arc<dyn std::any::Any + Send + Sync>);
    fn clear(&self);
}
