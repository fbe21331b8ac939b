//! Key repository
//!
//! Persistent script → derivation path index with per-(scheme, feature)
//! gap-limit windows and leased "next unused" reservations.

pub mod entry;
pub mod repository;

pub use entry::{GapWindow, KeyPath, KeyPathEntry, TrackedScheme};
pub use repository::{KeyRepository, RepositoryConfig, RepositoryError};
