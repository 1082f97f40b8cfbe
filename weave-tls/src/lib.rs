//! TLS termination and SNI pre-inspection handlers, built
//! directly on `rustls`'s non-blocking connection state machine.

pub mod error;
pub mod handler;
pub mod sni;

#[cfg(test)]
mod test_support;

pub use error::TlsHandlerError;
pub use handler::{HandshakeCompleted, TlsHandler};
pub use sni::{into_tls_handler, HotReloadingConfigProvider, SniHandler, SniResolved, TlsConfigProvider};
