//! Store facade bundling every entity store

pub mod store;

pub use store::Store;
