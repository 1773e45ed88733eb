//! The error type shared by the codec, arbiter, transaction, and loop layers.

use thiserror::Error;

/// Everything that can go wrong running a checkpoint transaction or loop.
///
/// Every transaction-phase function returns `Result<T, CoreError>`; the loop
/// treats any `Err` by raising failover if it hasn't already been raised,
/// then waiting for it to complete.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The control or data channel's underlying `Read`/`Write` call failed.
    #[error("control channel I/O error: {0}")]
    ChannelIo(#[from] std::io::Error),

    /// A received sync token didn't match what the protocol step expected.
    ///
    /// `expected` is `None` when the value wasn't recognized as any token at
    /// all (a decode failure), and `Some(_)` when it decoded but was the
    /// wrong token for the current step.
    #[error("protocol violation: expected {expected:?}, received {received:#x}")]
    ProtocolViolation {
        expected: Option<u64>,
        received: u64,
    },

    /// The VM state serializer collaborator failed.
    #[error("state serializer failed: {0}")]
    Serializer(String),

    /// The VM state loader collaborator failed.
    #[error("state loader failed: {0}")]
    Loader(String),

    /// The network proxy collaborator failed to initialize.
    #[error("proxy initialization failed: {0}")]
    ProxyInit(String),

    /// The network proxy collaborator failed during packet comparison.
    #[error("proxy compare failed: {0}")]
    ProxyCompare(String),

    /// The network proxy collaborator failed to signal a checkpoint boundary.
    #[error("proxy checkpoint signal failed: {0}")]
    ProxyCheckpoint(String),

    /// The network proxy collaborator failed to promote its mirrored state
    /// to authoritative during failover.
    #[error("proxy failover promotion failed: {0}")]
    ProxyFailover(String),

    /// The network proxy collaborator failed to tear down its resources.
    #[error("proxy teardown failed: {0}")]
    ProxyDestroy(String),

    /// A checkpoint buffer couldn't be grown to hold an incoming payload.
    #[error("checkpoint buffer allocation failed: requested {requested} bytes")]
    Allocation { requested: usize },

    /// Failover was requested while this operation was in flight.
    ///
    /// Not one of spec §7's eight kinds — added so a collaborator that
    /// observes `failover_requested` mid-call (for example a `VmController`
    /// whose `stop()` is interrupted) has a typed way to unwind through the
    /// transaction layer instead of inventing a message inside one of the
    /// other variants.
    #[error("failover requested during operation")]
    FailoverRequested,
}
