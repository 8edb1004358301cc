//! Overlay error kinds

use thiserror::Error;

/// Failures surfaced by overlay operations.
///
/// Any remote failure is first a signal to repair local state (evict the
/// unreachable peer), then either retried or surfaced as one of these.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// A remote call could not be completed after all retries.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A registration or fetch landed on a node that is no longer the
    /// surrogate root for the key.
    #[error("no longer the root for key {key:?}")]
    NotRoot { key: String },

    /// The blob store has no entry for the key.
    #[error("no blob stored for key {key:?}")]
    NotFound { key: String },

    /// The root answered but nobody is advertising the key.
    #[error("no replicas advertising key {key:?}")]
    NoReplicas { key: String },

    /// A malformed identifier or peer message.
    #[error("parse failure: {0}")]
    Parse(String),
}
