//! xpub-tracker: watch-only tracking of HD wallet derivation schemes
//!
//! This crate provides the core of a wallet backend for Bitcoin-like chains:
//! - Derivation schemes over BIP32 extended public keys (single key and multisig)
//! - Gap-limit key repository with leased "next unused" reservations
//! - Per-scheme change streams with resumable bookmarks and long polling
//! - Replace-by-fee, reorg and mempool-eviction handling
//! - Topological ordering of transaction batches
//! - JSON persistence over a pluggable key-value store
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xpub_tracker::core::Network;
//! use xpub_tracker::derivation::Feature;
//! use xpub_tracker::indexer::{Explorer, ExplorerConfig};
//! use xpub_tracker::storage::MemoryStore;
//!
//! let config = ExplorerConfig {
//!     network: Network::Main,
//!     ..Default::default()
//! };
//! let explorer = Explorer::with_store(Arc::new(MemoryStore::new()), config).unwrap();
//!
//! let scheme = explorer
//!     .parse_scheme("xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8")
//!     .unwrap();
//! explorer.track(&scheme).unwrap();
//!
//! let entry = explorer.get_unused(&scheme, Feature::Deposit, 0, true).unwrap().unwrap();
//! println!("Deposit address: {:?}", entry.address(Network::Main));
//! ```

pub mod cli;
pub mod core;
pub mod crypto;
pub mod derivation;
pub mod indexer;
pub mod repository;
pub mod sequencer;
pub mod storage;
pub mod tracker;

// Re-export commonly used types
pub use core::{Network, OutPoint, Script, Transaction, Txid};
pub use crypto::ExtendedPubKey;
pub use derivation::{DerivationScheme, Feature, SchemeParser};
pub use indexer::{Explorer, ExplorerConfig, IndexerError};
pub use repository::{KeyPath, KeyPathEntry, KeyRepository, RepositoryConfig};
pub use sequencer::{sort_transactions, topological_sort, CycleError};
pub use storage::{FileStore, KvStore, MemoryStore};
pub use tracker::{Bookmark, ChangeTracker, TrackerConfig, UtxoQuery, TransactionQuery};
