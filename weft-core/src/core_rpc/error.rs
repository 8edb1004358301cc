//! Transport-level error types

use thiserror::Error;

/// Failures of a single remote call. Every variant is grounds for
/// discarding the cached connection to the peer.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("call deadline exceeded")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unexpected response kind")]
    Unexpected,
}
