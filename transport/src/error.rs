use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the transport layer.
///
/// Clonable so a captured failure can be rethrown on every wait.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    #[error("rendezvous store: {0}")]
    Store(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("collective mismatch on tag {tag}: {reason}")]
    Mismatch { tag: u32, reason: String },

    #[error("point-to-point: {0}")]
    Buffer(String),
}
