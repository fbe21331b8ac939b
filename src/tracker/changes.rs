//! Query and result types of the change protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bookmark::Bookmark;
use crate::core::{BlockHash, OutPoint, Script, Transaction, Txid};
use crate::repository::KeyPath;

// =============================================================================
// Queries
// =============================================================================

/// Parameters of an incremental UTXO query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoQuery {
    pub confirmed_bookmark: Option<Bookmark>,
    pub unconfirmed_bookmark: Option<Bookmark>,
    /// Wait for changes when there are none yet
    #[serde(default)]
    pub long_polling: bool,
}

/// Parameters of an incremental transaction query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionQuery {
    pub confirmed_bookmark: Option<Bookmark>,
    pub unconfirmed_bookmark: Option<Bookmark>,
    pub replaced_bookmark: Option<Bookmark>,
    #[serde(default)]
    pub long_polling: bool,
    /// Attach the raw transaction to each entry
    #[serde(default)]
    pub include_transaction: bool,
}

// =============================================================================
// UTXO Changes
// =============================================================================

/// Unspent output owned by a scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: Script,
    pub key_path: KeyPath,
    /// First time the funding transaction was seen
    pub timestamp: DateTime<Utc>,
    pub confirmations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoChangeSet {
    pub bookmark: Bookmark,
    /// False when the result is a full resync
    pub known_bookmark: bool,
    pub utxos: Vec<UtxoEntry>,
    pub spent_outpoints: Vec<OutPoint>,
    pub has_changes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoChanges {
    pub current_height: Option<u32>,
    pub confirmed: UtxoChangeSet,
    pub unconfirmed: UtxoChangeSet,
}

impl UtxoChanges {
    pub fn has_changes(&self) -> bool {
        self.confirmed.has_changes || self.unconfirmed.has_changes
    }

    /// Query resuming from this result
    pub fn next_query(&self) -> UtxoQuery {
        UtxoQuery {
            confirmed_bookmark: Some(self.confirmed.bookmark),
            unconfirmed_bookmark: Some(self.unconfirmed.bookmark),
            long_polling: false,
        }
    }
}

// =============================================================================
// Transaction Changes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedOutput {
    pub index: u32,
    pub value: u64,
    pub script_pubkey: Script,
    pub key_path: KeyPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedInput {
    pub outpoint: OutPoint,
    pub value: u64,
    pub key_path: KeyPath,
}

/// Transaction as seen by one scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub txid: Txid,
    pub block_hash: Option<BlockHash>,
    pub height: Option<u32>,
    pub confirmations: u32,
    pub timestamp: DateTime<Utc>,
    pub outputs: Vec<MatchedOutput>,
    pub inputs: Vec<MatchedInput>,
    /// Received minus spent, in satoshis
    pub balance_change: i64,
    pub replaced_by: Option<Txid>,
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionChangeSet {
    pub bookmark: Bookmark,
    pub known_bookmark: bool,
    pub transactions: Vec<TransactionEntry>,
    pub has_changes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionChanges {
    pub current_height: Option<u32>,
    pub confirmed: TransactionChangeSet,
    pub unconfirmed: TransactionChangeSet,
    pub replaced: TransactionChangeSet,
}

impl TransactionChanges {
    pub fn has_changes(&self) -> bool {
        self.confirmed.has_changes || self.unconfirmed.has_changes || self.replaced.has_changes
    }

    pub fn next_query(&self) -> TransactionQuery {
        TransactionQuery {
            confirmed_bookmark: Some(self.confirmed.bookmark),
            unconfirmed_bookmark: Some(self.unconfirmed.bookmark),
            replaced_bookmark: Some(self.replaced.bookmark),
            long_polling: false,
            include_transaction: false,
        }
    }
}

/// Scheme-independent view of a tracked transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub txid: Txid,
    pub transaction: Transaction,
    pub block_hash: Option<BlockHash>,
    pub height: Option<u32>,
    pub confirmations: u32,
    pub timestamp: DateTime<Utc>,
    pub replaced_by: Option<Txid>,
}
