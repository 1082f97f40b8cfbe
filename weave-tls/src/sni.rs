//! Peeks the ClientHello before any handshake state is committed, so
//! the right server certificate/config can be picked per hostname. Built on
//! `rustls::server::Acceptor`, which already buffers partial ClientHello
//! records and exposes `client_hello()` once enough of the record has
//! arrived — no hand-rolled TLS record/handshake parser is needed here.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use bytes::Bytes;
use rustls::server::{Accepted, Acceptor};
use weave_core::error::PipelineError;
use weave_core::pipeline::context::{Context, PipelineMessage, WriteSignal};
use weave_core::pipeline::handler::{InboundHandler, OutboundHandler};

use crate::error::TlsHandlerError;
use crate::handler::TlsHandler;

/// Resolves a server TLS configuration for a (possibly absent) SNI
/// hostname. `None` is passed when the client sent no `server_name`
/// extension at all.
pub trait TlsConfigProvider: Send + Sync + 'static {
    fn resolve(&self, hostname: Option<&str>) -> Result<Arc<rustls::ServerConfig>, TlsHandlerError>;
}

/// A [`TlsConfigProvider`] mapping each known hostname to a config that can
/// be replaced at runtime without disturbing in-flight handshakes: readers
/// get an `Arc` snapshot from [`ArcSwap`], so a [`Self::replace`] call is
/// only ever visible to connections accepted after it lands.
pub struct HotReloadingConfigProvider {
    by_hostname: std::collections::HashMap<String, Arc<ArcSwap<rustls::ServerConfig>>>,
    default: Option<Arc<ArcSwap<rustls::ServerConfig>>>,
}

impl HotReloadingConfigProvider {
    pub fn new() -> Self {
        Self { by_hostname: std::collections::HashMap::new(), default: None }
    }

    /// Registers (or replaces) the hot-reloadable slot for `hostname`.
    pub fn insert(&mut self, hostname: impl Into<String>, config: Arc<rustls::ServerConfig>) {
        self.by_hostname.insert(hostname.into(), Arc::new(ArcSwap::new(config)));
    }

    /// The config served when the client sends no `server_name` extension.
    pub fn set_default(&mut self, config: Arc<rustls::ServerConfig>) {
        self.default = Some(Arc::new(ArcSwap::new(config)));
    }

    /// Atomically swaps in a new config for an already-registered
    /// hostname, returning the previous one. Connections mid-handshake
    /// keep the snapshot they already took.
    pub fn replace(
        &self,
        hostname: &str,
        config: Arc<rustls::ServerConfig>,
    ) -> Option<Arc<rustls::ServerConfig>> {
        self.by_hostname.get(hostname).map(|slot| slot.swap(config))
    }
}

impl Default for HotReloadingConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsConfigProvider for HotReloadingConfigProvider {
    fn resolve(&self, hostname: Option<&str>) -> Result<Arc<rustls::ServerConfig>, TlsHandlerError> {
        let slot = hostname
            .and_then(|h| self.by_hostname.get(h))
            .or(self.default.as_ref())
            .ok_or_else(|| TlsHandlerError::SniResolutionFailed {
                hostname: hostname.map(str::to_owned),
                reason: "no tls configuration registered for this hostname and no default set"
                    .to_string(),
            })?;
        Ok(slot.load_full())
    }
}

/// Fired once the ClientHello has been inspected and a config chosen, so
/// the pipeline owner can swap this handler for a [`TlsHandler`] built
/// from `accepted.into_connection(config)` — see [`InboundHandler::on_remove`]
/// for the intended swap point.
pub struct SniResolved {
    pub hostname: Option<String>,
    pub accepted: Accepted,
    pub config: Arc<rustls::ServerConfig>,
}

enum State {
    Buffering(Acceptor),
    Resolved,
}

/// Bytes/reads that arrive after [`SniResolved`] fires but before the
/// pipeline owner has swapped this handler for the resulting [`TlsHandler`]
/// — `suppressRead` per the hostname-routing handoff. Neither can go
/// anywhere useful yet: the bytes are already-buffered TLS record data the
/// new handler must see first, and a read request is something the new
/// handler, not this one, should be deciding whether to honor.
#[derive(Default)]
struct PendingIo {
    buffered: VecDeque<Bytes>,
    read_requested: bool,
}

pub struct SniHandler<P: TlsConfigProvider> {
    provider: P,
    state: Mutex<State>,
    pending: Mutex<PendingIo>,
}

impl<P: TlsConfigProvider> SniHandler<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            state: Mutex::new(State::Buffering(Acceptor::default())),
            pending: Mutex::new(PendingIo::default()),
        }
    }

    fn normalize_hostname(raw: &str) -> Result<String, TlsHandlerError> {
        idna::domain_to_ascii(raw)
            .map(|ascii| ascii.to_ascii_lowercase())
            .map_err(|e| TlsHandlerError::SniResolutionFailed {
                hostname: Some(raw.to_string()),
                reason: format!("invalid sni hostname encoding: {e}"),
            })
    }
}

impl<P: TlsConfigProvider> InboundHandler for SniHandler<P> {
    fn on_read(&self, ctx: &dyn Context, msg: PipelineMessage) {
        let input = match msg {
            PipelineMessage::Bytes(b) => b,
            other => {
                ctx.fire_inbound(other);
                return;
            }
        };

        let mut state = self.state.lock().unwrap();
        let acceptor = match &mut *state {
            State::Buffering(acceptor) => acceptor,
            State::Resolved => {
                // Already resolved but the pipeline owner hasn't swapped us
                // out yet; these bytes belong to the handler taking over, not
                // to whatever sits downstream of this one, so they queue
                // here until `on_remove` hands them off.
                self.pending.lock().unwrap().buffered.push_back(input);
                return;
            }
        };

        let mut cursor = std::io::Cursor::new(input.as_ref());
        if let Err(e) = acceptor.read_tls(&mut cursor) {
            ctx.fire_exception(PipelineError::Other(format!(
                "failed reading client hello: {e}"
            )));
            let _ = ctx.close_async();
            return;
        }

        let accepted = match acceptor.accept() {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return, // need more bytes before the hello is complete
            Err((e, _alert)) => {
                ctx.fire_exception(PipelineError::Other(format!(
                    "malformed client hello: {e}"
                )));
                let _ = ctx.close_async();
                return;
            }
        };

        let raw_hostname = accepted.client_hello().server_name().map(str::to_owned);
        let normalized = match raw_hostname.as_deref() {
            Some(raw) => match Self::normalize_hostname(raw) {
                Ok(ascii) => Some(ascii),
                Err(e) => {
                    tracing::warn!(hostname = %raw, error = %e, "sni normalization failed");
                    ctx.fire_exception(PipelineError::Other(e.to_string()));
                    let _ = ctx.close_async();
                    return;
                }
            },
            None => None,
        };

        let config = match self.provider.resolve(normalized.as_deref()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(hostname = ?normalized, error = %e, "sni config resolution failed");
                ctx.fire_exception(PipelineError::Other(e.to_string()));
                let _ = ctx.close_async();
                return;
            }
        };

        tracing::debug!(hostname = ?normalized, "sni resolved, handing off to tls handler");
        *state = State::Resolved;
        ctx.fire_user_event(Arc::new(SniResolved { hostname: normalized, accepted, config }));
    }

    fn on_remove(&self, ctx: &dyn Context) {
        let mut pending = self.pending.lock().unwrap();
        let buffered = std::mem::take(&mut pending.buffered);
        let read_requested = std::mem::take(&mut pending.read_requested);
        drop(pending);

        for chunk in buffered {
            ctx.fire_inbound(PipelineMessage::Bytes(chunk));
        }
        if read_requested {
            ctx.read();
        }
    }
}

impl<P: TlsConfigProvider> OutboundHandler for SniHandler<P> {
    fn on_write(&self, ctx: &dyn Context, msg: PipelineMessage) -> Result<WriteSignal, PipelineError> {
        // Nothing writes application bytes through this handler before the
        // handshake owner swaps it for the resulting TLS handler; pass
        // straight through to the transport.
        let _ = ctx.write_async(msg);
        Ok(WriteSignal::Accepted)
    }

    fn on_read(&self, ctx: &dyn Context) {
        let resolved = matches!(*self.state.lock().unwrap(), State::Resolved);
        if resolved {
            self.pending.lock().unwrap().read_requested = true;
        } else {
            ctx.read();
        }
    }
}

/// Build the [`TlsHandler`] a pipeline owner installs in place of the
/// [`SniHandler`] after a [`SniResolved`] event, handing off to the TLS
/// termination handler.
pub fn into_tls_handler(resolved: SniResolved) -> Result<TlsHandler, TlsHandlerError> {
    let connection = resolved
        .accepted
        .into_connection(resolved.config)
        .map_err(|(e, _alert)| TlsHandlerError::ConnectionSetup(e))?;
    Ok(TlsHandler::server(connection))
}
