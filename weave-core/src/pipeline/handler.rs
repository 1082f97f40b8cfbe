//! Inbound/outbound handler contracts. A handler is the unit that gets
//! wired into a pipeline; decoders, the aggregator, the TLS handler and the
//! SNI handler in the sibling crates all implement these.

use crate::error::PipelineError;
use crate::pipeline::context::{Context, PipelineMessage, WriteSignal};

/// The forward (transport → application) data path.
///
/// Every method runs on the channel's event loop; implementations must not
/// block or perform unbounded work inline — hand it to `ctx.event_loop()`
/// instead.
pub trait InboundHandler: Send + Sync + 'static {
    fn on_channel_active(&self, _ctx: &dyn Context) {}

    fn on_read(&self, ctx: &dyn Context, msg: PipelineMessage);

    fn on_read_complete(&self, _ctx: &dyn Context) {}

    fn on_writability_changed(&self, _ctx: &dyn Context, _is_writable: bool) {}

    fn on_user_event(&self, ctx: &dyn Context, event: std::sync::Arc<dyn std::any::Any + Send + Sync>) {
        // Default: keep propagating, matching Netty/tower-style middleware
        // that only intercepts the events it cares about.
        ctx.fire_user_event(event);
    }

    fn on_exception_caught(&self, ctx: &dyn Context, err: PipelineError) {
        ctx.fire_exception(err);
    }

    fn on_channel_inactive(&self, _ctx: &dyn Context) {}

    /// Called once when the handler is removed from the pipeline (e.g. the
    /// SNI handler swapping itself for a TLS handler).
    fn on_remove(&self, _ctx: &dyn Context) {}
}

/// The reverse (application → transport) data path.
pub trait OutboundHandler: Send + Sync + 'static {
    fn on_write(&self, ctx: &dyn Context, msg: PipelineMessage) -> Result<WriteSignal, PipelineError>;

    /// A read was requested by something above this handler in the chain.
    /// Default: pass it straight through to the transport. A handler that
    /// needs to gate reads on internal state (the TLS handler while
    /// handshaking, the SNI handler while awaiting a config swap) overrides
    /// this to suppress or defer the call instead of forwarding it.
    fn on_read(&self, ctx: &dyn Context) {
        ctx.read();
    }

    fn on_flush(&self, _ctx: &dyn Context) -> Result<(), PipelineError> {
        Ok(())
    }

    fn on_close_graceful(
        &self,
        _ctx: &dyn Context,
        _deadline: Option<std::time::Duration>,
    ) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// A handler that participates in both directions (a codec that both
/// decodes and encodes, for instance).
pub trait DuplexHandler: InboundHandler + OutboundHandler {}
impl<T: InboundHandler + OutboundHandler> DuplexHandler for T {}
