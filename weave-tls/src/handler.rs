//! Wires `rustls`'s own non-blocking connection state machine into the
//! pipeline. A non-blocking TLS engine whose `process_input` model
//! eliminates the need for a virtual stream: `rustls::ServerConnection`/
//! `ClientConnection` already is that engine — `read_tls`/
//! `process_new_packets`/`reader().read()`/`writer().write()`/
//! `write_tls()` are all synchronous, buffer-oriented calls, so there is
//! no mediation stream with a parked read future here.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Mutex;

use bytes::Bytes;
use rustls::{ClientConnection, ServerConnection};
use weave_core::pipeline::context::{Context, PipelineMessage, WriteSignal};
use weave_core::pipeline::handler::{InboundHandler, OutboundHandler};
use weave_core::error::{CodecError, PipelineError};

use crate::error::TlsHandlerError;

/// Coalesce plaintext writes up to this many bytes per `write_plaintext`
/// call — a ~14 KiB batching policy.
const PENDING_WRITE_BATCH_BYTES: usize = 14 * 1024;

enum Engine {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Engine {
    fn is_handshaking(&self) -> bool {
        match self {
            Self::Server(c) => c.is_handshaking(),
            Self::Client(c) => c.is_handshaking(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Server(c) => c.wants_write(),
            Self::Client(c) => c.wants_write(),
        }
    }

    fn read_tls(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        let mut cursor = std::io::Cursor::new(bytes);
        match self {
            Self::Server(c) => c.read_tls(&mut cursor),
            Self::Client(c) => c.read_tls(&mut cursor),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Self::Server(c) => c.process_new_packets(),
            Self::Client(c) => c.process_new_packets(),
        }
    }

    fn write_tls(&mut self, out: &mut Vec<u8>) -> std::io::Result<usize> {
        match self {
            Self::Server(c) => c.write_tls(out),
            Self::Client(c) => c.write_tls(out),
        }
    }

    fn drain_plaintext(&mut self) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let read = match self {
                Self::Server(c) => c.reader().read(&mut chunk),
                Self::Client(c) => c.reader().read(&mut chunk),
            };
            match read {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn write_plaintext(&mut self, data: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Server(c) => c.writer().write(data),
            Self::Client(c) => c.writer().write(data),
        }
    }
}

/// The `{Authenticating, Authenticated, FailedAuthentication,
/// ReadRequestedBeforeAuthenticated, FlushedBeforeHandshake}` bit set
/// tracking handshake progress.
#[derive(Debug, Default, Clone, Copy)]
struct StateFlags {
    authenticating: bool,
    authenticated: bool,
    failed_authentication: bool,
    read_requested_before_authenticated: bool,
    flushed_before_handshake: bool,
}

struct Inner {
    engine: Engine,
    state: StateFlags,
    pending_writes: VecDeque<Bytes>,
}

pub struct TlsHandler {
    inner: Mutex<Inner>,
}

impl TlsHandler {
    pub fn server(connection: ServerConnection) -> Self {
        Self::new(Engine::Server(connection))
    }

    pub fn client(connection: ClientConnection) -> Self {
        Self::new(Engine::Client(connection))
    }

    fn new(engine: Engine) -> Self {
        Self {
            inner: Mutex::new(Inner {
                engine,
                state: StateFlags { authenticating: true, ..Default::default() },
                pending_writes: VecDeque::new(),
            }),
        }
    }

    /// Push any ciphertext `rustls` has queued for us out to the transport.
    fn drain_ciphertext(inner: &mut Inner, ctx: &dyn Context) {
        while inner.engine.wants_write() {
            let mut out = Vec::new();
            match inner.engine.write_tls(&mut out) {
                Ok(0) => break,
                Ok(_) => {
                    // `write_and_flush`'s effect happens synchronously from
                    // the engine's perspective; the returned future only
                    // reports completion, so a fire-and-forget drop is
                    // correct here rather than awaiting it inline.
                    let _ = ctx.write_and_flush(PipelineMessage::Bytes(Bytes::from(out)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed writing tls record to transport");
                    break;
                }
            }
        }
    }

    fn handle_handshake_completion(inner: &mut Inner, ctx: &dyn Context) {
        if inner.state.authenticating && !inner.engine.is_handshaking() {
            inner.state.authenticating = false;
            inner.state.authenticated = true;
            tracing::debug!("tls handshake completed");
            ctx.fire_user_event(std::sync::Arc::new(HandshakeCompleted::Success));

            if inner.state.read_requested_before_authenticated {
                inner.state.read_requested_before_authenticated = false;
                ctx.read();
            }
            if inner.state.flushed_before_handshake {
                inner.state.flushed_before_handshake = false;
                Self::flush_pending_writes(inner, ctx);
            }
        }
    }

    fn fail_handshake(inner: &mut Inner, ctx: &dyn Context, cause: rustls::Error) {
        if inner.state.failed_authentication {
            return;
        }
        inner.state.authenticating = false;
        inner.state.failed_authentication = true;
        tracing::warn!(error = %cause, "tls handshake failed");
        ctx.fire_user_event(std::sync::Arc::new(HandshakeCompleted::Failure));
        inner.pending_writes.clear();
        let _ = ctx.close_async();
        ctx.fire_exception(PipelineError::Other(
            TlsHandlerError::HandshakeFailed(cause).to_string(),
        ));
    }

    fn flush_pending_writes(inner: &mut Inner, ctx: &dyn Context) {
        while let Some(first) = inner.pending_writes.pop_front() {
            if inner.pending_writes.is_empty() {
                if let Err(e) = inner.engine.write_plaintext(&first) {
                    tracing::warn!(error = %e, "tls write_plaintext failed");
                    break;
                }
            } else {
                let mut batch = Vec::with_capacity(PENDING_WRITE_BATCH_BYTES);
                batch.extend_from_slice(&first);
                while let Some(next) = inner.pending_writes.front() {
                    if batch.len() + next.len() > PENDING_WRITE_BATCH_BYTES {
                        break;
                    }
                    let next = inner.pending_writes.pop_front().unwrap();
                    batch.extend_from_slice(&next);
                }
                if let Err(e) = inner.engine.write_plaintext(&batch) {
                    tracing::warn!(error = %e, "tls write_plaintext failed");
                    break;
                }
            }
        }
        Self::drain_ciphertext(inner, ctx);
    }
}

/// Fired via [`Context::fire_user_event`] when the handshake finishes.
#[derive(Debug, Clone, Copy)]
pub enum HandshakeCompleted {
    Success,
    Failure,
}

impl InboundHandler for TlsHandler {
    fn on_channel_active(&self, ctx: &dyn Context) {
        let mut inner = self.inner.lock().unwrap();
        // A client connection has a ClientHello queued the moment it is
        // constructed; push it out immediately rather than waiting for an
        // explicit flush.
        Self::drain_ciphertext(&mut inner, ctx);
    }

    fn on_read(&self, ctx: &dyn Context, msg: PipelineMessage) {
        let input = match msg {
            PipelineMessage::Bytes(b) => b,
            other => {
                ctx.fire_inbound(other);
                return;
            }
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.state.failed_authentication {
            return;
        }

        if let Err(e) = inner.engine.read_tls(&input) {
            let codec_err = CodecError::NotSslRecord(e.to_string());
            tracing::warn!(error = %e, kind = ?codec_err.kind(), "not an ssl/tls record");
            ctx.fire_exception(PipelineError::Codec(codec_err));
            let _ = ctx.close_async();
            return;
        }

        match inner.engine.process_new_packets() {
            Ok(_) => {}
            Err(e) => {
                Self::fail_handshake(&mut inner, ctx, e);
                return;
            }
        }

        match inner.engine.drain_plaintext() {
            Ok(plaintext) if !plaintext.is_empty() => {
                ctx.fire_inbound(PipelineMessage::Bytes(Bytes::from(plaintext)));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "tls plaintext read failed");
            }
        }

        Self::drain_ciphertext(&mut inner, ctx);
        Self::handle_handshake_completion(&mut inner, ctx);
    }

    fn on_channel_inactive(&self, ctx: &dyn Context) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_writes.clear();
        ctx.fire_inbound_complete();
    }
}

impl OutboundHandler for TlsHandler {
    fn on_write(&self, _ctx: &dyn Context, msg: PipelineMessage) -> Result<WriteSignal, PipelineError> {
        let bytes = match msg {
            PipelineMessage::Bytes(b) => b,
            PipelineMessage::Message(_) => {
                return Err(PipelineError::Other("tls handler only accepts raw plaintext bytes".into()));
            }
        };
        let mut inner = self.inner.lock().unwrap();
        inner.pending_writes.push_back(bytes);
        Ok(WriteSignal::Accepted)
    }

    fn on_flush(&self, ctx: &dyn Context) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.authenticated {
            inner.state.flushed_before_handshake = true;
            return Ok(());
        }
        Self::flush_pending_writes(&mut inner, ctx);
        Ok(())
    }

    fn on_read(&self, ctx: &dyn Context) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.authenticated {
            ctx.read();
        } else {
            inner.state.read_requested_before_authenticated = true;
        }
    }
}
