//! Blockchain watcher facade
//!
//! Wires the key repository and the change tracker to one store and
//! exposes ingestion and query entry points.

pub mod config;
pub mod explorer;

pub use config::ExplorerConfig;
pub use explorer::{Explorer, IndexerError};
