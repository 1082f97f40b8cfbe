//! Wires a [`DecodeLoop`] into the pipeline as an [`InboundHandler`],
//! implementing the `on_read` / `on_read_complete` / `on_inactive` /
//! `on_remove` contract of the decoding framework.

use std::sync::Mutex;

use bytes::Bytes;

use crate::buffer::{Cumulation, CumulatorKind};
use crate::decoder::{ByteDecoder, DecodeLoop};
use crate::error::{CodecError, PipelineError};
use crate::pipeline::context::{Context, PipelineMessage};
use crate::pipeline::handler::InboundHandler;

struct State {
    cumulation: Cumulation,
    cumulator: CumulatorKind,
    last_pass_produced_nothing: bool,
}

/// An [`InboundHandler`] that cumulates raw bytes and feeds them to a
/// [`ByteDecoder`], firing every produced item downstream in order.
pub struct FramingHandler<D: ByteDecoder> {
    inner: Mutex<(DecodeLoop<D>, State)>,
    auto_read: bool,
}

impl<D: ByteDecoder> FramingHandler<D> {
    pub fn new(decoder: D) -> Self {
        Self::with_cumulator(decoder, CumulatorKind::Merge)
    }

    pub fn with_cumulator(decoder: D, cumulator: CumulatorKind) -> Self {
        Self {
            inner: Mutex::new((
                DecodeLoop::new(decoder),
                State {
                    cumulation: Cumulation::default(),
                    cumulator,
                    last_pass_produced_nothing: false,
                },
            )),
            auto_read: true,
        }
    }

    pub fn single_decode(mut self, single: bool) -> Self {
        self.inner.get_mut().unwrap().0.single_decode = single;
        self
    }

    pub fn auto_read(mut self, auto_read: bool) -> Self {
        self.auto_read = auto_read;
        self
    }

    fn append(state: &mut State, input: Bytes) {
        match state.cumulator {
            CumulatorKind::Merge => state.cumulation.extend_merge(input),
            CumulatorKind::Composite => state.cumulation.extend_composite(input),
        }
    }
}

impl<D> InboundHandler for FramingHandler<D>
where
    D: ByteDecoder + 'static,
{
    fn on_read(&self, ctx: &dyn Context, msg: PipelineMessage) {
        let input = match msg {
            PipelineMessage::Bytes(b) => b,
            // A decoder sitting behind another framer (e.g. the message
            // aggregator behind a length-field decoder) receives already
            // framed messages, not bytes — nothing to cumulate.
            other => {
                ctx.fire_inbound(other);
                return;
            }
        };

        let mut guard = self.inner.lock().unwrap();
        let (loop_, state) = &mut *guard;
        Self::append(state, input);

        let mut out = Vec::new();
        let result = loop_.run(&mut state.cumulation, false, &mut out);
        state.last_pass_produced_nothing = out.is_empty();
        if state.cumulation.is_empty() {
            state.cumulation = Cumulation::Empty;
        }
        drop(guard);

        for item in out {
            ctx.fire_inbound(PipelineMessage::message(item));
        }

        if let Err(e) = result {
            tracing::warn!(error = %e, "framing handler firing decode exception");
            ctx.fire_exception(PipelineError::Codec(e));
        }
    }

    fn on_read_complete(&self, ctx: &dyn Context) {
        let produced_nothing = self.inner.lock().unwrap().1.last_pass_produced_nothing;
        if produced_nothing && !self.auto_read {
            ctx.read();
        }
        ctx.fire_inbound_complete();
    }

    fn on_channel_inactive(&self, ctx: &dyn Context) {
        tracing::debug!("channel inactive, draining decoder at end of stream");
        let mut guard = self.inner.lock().unwrap();
        let (loop_, state) = &mut *guard;
        let mut out = Vec::new();
        let result = loop_.run(&mut state.cumulation, true, &mut out);
        state.cumulation = Cumulation::Empty;
        drop(guard);

        for item in out {
            ctx.fire_inbound(PipelineMessage::message(item));
        }
        if let Err(e) = result {
            tracing::warn!(error = %e, "framing handler firing decode exception at channel close");
            ctx.fire_exception(PipelineError::Codec(e));
        }
        ctx.fire_inbound_complete();
    }

    fn on_remove(&self, ctx: &dyn Context) {
        let mut guard = self.inner.lock().unwrap();
        let state = &mut guard.1;
        if !state.cumulation.is_empty() {
            let len = state.cumulation.readable();
            tracing::debug!(bytes = len, "handler removed with undecoded bytes still buffered");
            let remaining = state.cumulation.split_frame(len);
            drop(guard);
            ctx.fire_inbound(PipelineMessage::Bytes(remaining));
        }
    }
}

/// Re-exported so callers can match on it without importing [`CodecError`]
/// directly from the decoder module.
pub type DecodeError = CodecError;
