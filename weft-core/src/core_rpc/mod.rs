pub mod client;
pub mod error;
pub mod message;
pub mod server;
pub mod transport;

pub use client::RpcClient;
pub use error::RpcError;
