use thiserror::Error;

use lockstep_transport::TransportError;

/// Failures surfaced by the engine.
///
/// Validation failures are raised synchronously from the submitting thread;
/// transport failures inside a running work item are captured and rethrown
/// from every `wait()`, which is why the type is `Clone`.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Rejected before any work was enqueued.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The transport failed or timed out underneath an operation.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The operation or device placement is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Conditions that leave no usable group or dispatch.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
