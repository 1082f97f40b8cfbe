use thiserror::Error;

/// TLS-specific failures that are not already covered by
/// [`weave_core::CodecError`] — the handshake outcome and the SNI
/// pre-inspection path.
#[derive(Debug, Error)]
pub enum TlsHandlerError {
    #[error("tls handshake failed: {0}")]
    HandshakeFailed(#[source] rustls::Error),

    #[error("failed to build a server connection for the resolved configuration: {0}")]
    ConnectionSetup(#[source] rustls::Error),

    #[error("sni resolver rejected hostname {hostname:?}: {reason}")]
    SniResolutionFailed { hostname: Option<String>, reason: String },
}
