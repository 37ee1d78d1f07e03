//! JSON-RPC server module

pub mod server;
pub mod types;

pub use server::RpcServer;
pub use types::*;
