use thiserror::Error;

/// Pool failures. Distinct from [`weave_core::CodecError`]/
/// [`weave_core::PipelineError`] — a pool is not on the decode path.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool closed on acquire")]
    ClosedOnAcquire,

    #[error("pool closed while channel was in use")]
    ClosedWhileAcquired,

    #[error("too many outstanding acquire operations")]
    PoolFull,

    #[error("acquire timed out after {0:?}")]
    AcquireTimedOut(std::time::Duration),

    #[error("channel was not acquired from this pool")]
    NotAcquiredFromThisPool,

    #[error("bootstrap failed to establish a connection: {0}")]
    BootstrapFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
}
