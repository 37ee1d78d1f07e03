//! Ledger configuration module
//! Handles loading and saving the config file

pub mod config;

pub use config::{Config, PoolConfig, ServerConfig};
