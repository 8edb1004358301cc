//! Weft: a decentralized object location and routing overlay.
//!
//! Nodes carry 40-digit base-16 identifiers and route by shared prefix,
//! scanning right from a missing digit to the next populated column; the
//! last hop of that walk is the surrogate root for a key. Objects are
//! advertised to their key's root as soft state and fetched directly from
//! whichever replica holds the bytes.

pub mod client;
pub mod config;
pub mod core_overlay;
pub mod core_rpc;
pub mod core_store;
pub mod logging;

pub use client::WeftClient;
pub use config::OverlayConfig;
pub use core_overlay::{NodeId, OverlayError, RemoteNode, WeftNode};
pub use core_store::BlobStore;
pub use logging::{init_logging, LogLevel};
