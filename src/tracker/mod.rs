//! Change tracker
//!
//! Per-scheme change streams answering bookmark-based queries:
//! - Bookmarks (opaque epoch + position handles)
//! - Confirmed, unconfirmed and replaced event streams
//! - UTXO and transaction deltas with long polling
//! - Block, reorg and mempool-eviction handling

pub mod bookmark;
pub mod changes;
pub mod ledger;
pub mod notifications;
pub mod stream;
pub mod tracker;

pub use bookmark::Bookmark;
pub use changes::{
    MatchedInput, MatchedOutput, TransactionChangeSet, TransactionChanges, TransactionEntry,
    TransactionInfo, TransactionQuery, UtxoChangeSet, UtxoChanges, UtxoEntry, UtxoQuery,
};
pub use ledger::{BlockRef, OutputMatch, TrackedTransaction, TxStatus};
pub use notifications::{Notifier, TrackerNotification};
pub use tracker::{ChangeTracker, TrackerConfig, TrackerError};
