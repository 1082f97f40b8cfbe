//! A minimal in-memory [`Context`] double for exercising handlers without a
//! real event loop or transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use weave_core::error::PipelineError;
use weave_core::pipeline::context::{
    AttributeKey, AttributeSlot, BoxFuture, Context, EventLoop, PipelineMessage, TimerHandle, WriteSignal,
};

use crate::sni::SniResolved;

struct InlineEventLoop;

impl EventLoop for InlineEventLoop {
    fn in_loop(&self) -> bool {
        true
    }

    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }

    fn schedule(&self, task: Box<dyn FnOnce() + Send>, _delay: Duration) -> Box<dyn TimerHandle> {
        task();
        Box::new(TimerHandle2)
    }
}

struct TimerHandle2;
impl TimerHandle for TimerHandle2 {
    fn cancel(&self) {}
}

struct NullSlot;
impl AttributeSlot for NullSlot {
    fn get(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        None
    }
    fn set(&self, _value: Arc<dyn std::any::Any + Send + Sync>) {}
    fn clear(&self) {}
}

#[derive(Default)]
pub struct RecordingContext {
    pub inbound: Mutex<Vec<PipelineMessage>>,
    pub written: Mutex<Vec<PipelineMessage>>,
    pub exceptions: Mutex<Vec<String>>,
    pub user_events: Mutex<Vec<Arc<dyn std::any::Any + Send + Sync>>>,
    pub closed: Mutex<bool>,
    pub reads: Mutex<u32>,
}

impl RecordingContext {
    pub fn take_sni_resolved(&self) -> Option<Arc<SniResolved>> {
        self.user_events
            .lock()
            .unwrap()
            .iter()
            .find_map(|e| e.clone().downcast::<SniResolved>().ok())
    }

    /// Removes and returns everything written so far, so a test can pump
    /// it into the peer side of a handshake without re-delivering bytes
    /// already fed on a previous pass.
    pub fn drain_written(&self) -> Vec<PipelineMessage> {
        std::mem::take(&mut *self.written.lock().unwrap())
    }
}

impl Context for RecordingContext {
    fn event_loop(&self) -> &dyn EventLoop {
        // A single static instance is sufficient: the double is stateless.
        static LOOP: InlineEventLoop = InlineEventLoop;
        &LOOP
    }

    fn fire_inbound(&self, msg: PipelineMessage) {
        self.inbound.lock().unwrap().push(msg);
    }

    fn fire_inbound_complete(&self) {}

    fn fire_user_event(&self, event: Arc<dyn std::any::Any + Send + Sync>) {
        self.user_events.lock().unwrap().push(event);
    }

    fn fire_exception(&self, err: PipelineError) {
        self.exceptions.lock().unwrap().push(err.to_string());
    }

    fn read(&self) {
        *self.reads.lock().unwrap() += 1;
    }

    fn write_async(&self, msg: PipelineMessage) -> BoxFuture<'static, Result<(), PipelineError>> {
        self.written.lock().unwrap().push(msg);
        Box::pin(async { Ok(()) })
    }

    fn write_and_flush(&self, msg: PipelineMessage) -> BoxFuture<'static, Result<(), PipelineError>> {
        self.written.lock().unwrap().push(msg);
        Box::pin(async { Ok(()) })
    }

    fn flush(&self) {}

    fn close_async(&self) -> BoxFuture<'static, Result<(), PipelineError>> {
        *self.closed.lock().unwrap() = true;
        Box::pin(async { Ok(()) })
    }

    fn attribute(&self, _key: AttributeKey) -> &dyn AttributeSlot {
        static SLOT: NullSlot = NullSlot;
        &SLOT
    }
}
