//! Workflow ledger - durable state and audit store for multi-agent code analysis workflows

pub mod cli;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod rpc;

pub use core::Store;
pub use error::{Result, StoreError};
