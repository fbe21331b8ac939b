//! Tracked transactions and the indexes derived from them
//!
//! The ledger holds every transaction relevant to at least one scheme,
//! the known chain of blocks, and two derived maps: owned outputs
//! (outpoint → scheme) and spenders (outpoint → spending transaction).
//! Only active transactions (unconfirmed or confirmed) feed the derived
//! maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::core::{BlockHash, OutPoint, Script, Transaction, Txid};
use crate::repository::KeyPath;

/// Block a transaction was confirmed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub hash: BlockHash,
    pub height: u32,
}

/// Lifecycle of a tracked transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TxStatus {
    Unconfirmed,
    Confirmed { block: BlockRef },
    Replaced { by: Txid },
}

/// Output of a transaction that belongs to a scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMatch {
    pub scheme: String,
    pub vout: u32,
    pub key_path: KeyPath,
}

/// Persisted transaction record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTransaction {
    pub txid: Txid,
    pub transaction: Transaction,
    pub first_seen: DateTime<Utc>,
    pub status: TxStatus,
    pub matches: Vec<OutputMatch>,
    /// Schemes receiving or spending through this transaction
    pub schemes: BTreeSet<String>,
}

impl TrackedTransaction {
    pub fn is_active(&self) -> bool {
        !matches!(self.status, TxStatus::Replaced { .. })
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.status, TxStatus::Confirmed { .. })
    }

    pub fn is_unconfirmed(&self) -> bool {
        self.status == TxStatus::Unconfirmed
    }

    pub fn block(&self) -> Option<BlockRef> {
        match self.status {
            TxStatus::Confirmed { block } => Some(block),
            _ => None,
        }
    }

    pub fn replaced_by(&self) -> Option<Txid> {
        match self.status {
            TxStatus::Replaced { by } => Some(by),
            _ => None,
        }
    }
}

/// Output owned by a scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedOutput {
    pub scheme: String,
    pub value: u64,
    pub script_pubkey: Script,
    pub key_path: KeyPath,
}

#[derive(Debug, Default)]
pub struct Ledger {
    chain: BTreeMap<u32, BlockHash>,
    transactions: HashMap<Txid, TrackedTransaction>,
    owners: HashMap<OutPoint, OwnedOutput>,
    spenders: HashMap<OutPoint, Txid>,
    block_txs: HashMap<BlockHash, BTreeSet<Txid>>,
}

impl Ledger {
    // =========================================================================
    // Chain
    // =========================================================================

    pub fn tip(&self) -> Option<BlockRef> {
        self.chain
            .iter()
            .next_back()
            .map(|(height, hash)| BlockRef {
                hash: *hash,
                height: *height,
            })
    }

    pub fn current_height(&self) -> Option<u32> {
        self.tip().map(|tip| tip.height)
    }

    pub fn block_height(&self, hash: &BlockHash) -> Option<u32> {
        self.chain
            .iter()
            .find(|(_, known)| *known == hash)
            .map(|(height, _)| *height)
    }

    /// Blocks at or above `height`, tip first
    pub fn blocks_from(&self, height: u32) -> Vec<BlockRef> {
        self.chain
            .range(height..)
            .rev()
            .map(|(height, hash)| BlockRef {
                hash: *hash,
                height: *height,
            })
            .collect()
    }

    pub fn set_block(&mut self, block: BlockRef) {
        self.chain.insert(block.height, block.hash);
    }

    pub fn remove_block(&mut self, height: u32) {
        self.chain.remove(&height);
    }

    /// `tip - height + 1` for confirmed transactions, 0 otherwise
    pub fn confirmations(&self, status: &TxStatus) -> u32 {
        match status {
            TxStatus::Confirmed { block } => match self.current_height() {
                Some(tip) => tip.saturating_sub(block.height) + 1,
                None => 1,
            },
            _ => 0,
        }
    }

    // =========================================================================
    // Records
    // =========================================================================

    pub fn get(&self, txid: &Txid) -> Option<&TrackedTransaction> {
        self.transactions.get(txid)
    }

    pub fn transactions(&self) -> impl Iterator<Item = &TrackedTransaction> {
        self.transactions.values()
    }

    pub fn transactions_in_block(&self, hash: &BlockHash) -> Vec<Txid> {
        self.block_txs
            .get(hash)
            .map(|txids| txids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Insert a record, replacing any previous state of the same txid
    pub fn attach(&mut self, record: TrackedTransaction) {
        self.detach(&record.txid);
        let txid = record.txid;
        if record.is_active() {
            for matched in &record.matches {
                let output = match record.transaction.outputs.get(matched.vout as usize) {
                    Some(output) => output,
                    None => continue,
                };
                self.owners.insert(
                    OutPoint::new(txid, matched.vout),
                    OwnedOutput {
                        scheme: matched.scheme.clone(),
                        value: output.value,
                        script_pubkey: output.script_pubkey.clone(),
                        key_path: matched.key_path,
                    },
                );
            }
            for outpoint in record.transaction.spent_outpoints() {
                self.spenders.insert(outpoint, txid);
            }
        }
        if let Some(block) = record.block() {
            self.block_txs.entry(block.hash).or_default().insert(txid);
        }
        self.transactions.insert(txid, record);
    }

    /// Remove a record and everything derived from it
    pub fn detach(&mut self, txid: &Txid) -> Option<TrackedTransaction> {
        let record = self.transactions.remove(txid)?;
        if record.is_active() {
            for matched in &record.matches {
                self.owners.remove(&OutPoint::new(*txid, matched.vout));
            }
            for outpoint in record.transaction.spent_outpoints() {
                if self.spenders.get(&outpoint) == Some(txid) {
                    self.spenders.remove(&outpoint);
                }
            }
        }
        if let Some(block) = record.block() {
            if let Some(txids) = self.block_txs.get_mut(&block.hash) {
                txids.remove(txid);
                if txids.is_empty() {
                    self.block_txs.remove(&block.hash);
                }
            }
        }
        Some(record)
    }

    // =========================================================================
    // Ownership
    // =========================================================================

    pub fn owner(&self, outpoint: &OutPoint) -> Option<&OwnedOutput> {
        self.owners.get(outpoint)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<&TrackedTransaction> {
        self.spenders
            .get(outpoint)
            .and_then(|txid| self.transactions.get(txid))
    }

    /// Whether `outpoint` is spent, counting only confirmed spenders if asked
    pub fn is_spent(&self, outpoint: &OutPoint, confirmed_only: bool) -> bool {
        match self.spender(outpoint) {
            Some(spender) => !confirmed_only || spender.is_confirmed(),
            None => false,
        }
    }

    /// Schemes owning any of the outpoints `transaction` spends
    pub fn input_schemes(&self, transaction: &Transaction) -> BTreeSet<String> {
        transaction
            .spent_outpoints()
            .filter_map(|outpoint| self.owners.get(&outpoint))
            .map(|owned| owned.scheme.clone())
            .collect()
    }

    /// Inputs of `transaction` that spend outputs owned by `scheme`
    pub fn owned_inputs(&self, transaction: &Transaction, scheme: &str) -> Vec<(OutPoint, OwnedOutput)> {
        transaction
            .spent_outpoints()
            .filter_map(|outpoint| {
                self.owners
                    .get(&outpoint)
                    .filter(|owned| owned.scheme == scheme)
                    .map(|owned| (outpoint, owned.clone()))
            })
            .collect()
    }

    /// Active transactions spending any input `transaction` spends
    pub fn conflicts(&self, transaction: &Transaction, txid: &Txid) -> Vec<Txid> {
        let mut found: Vec<Txid> = Vec::new();
        for outpoint in transaction.spent_outpoints() {
            if let Some(spender) = self.spenders.get(&outpoint) {
                if spender != txid && !found.contains(spender) {
                    found.push(*spender);
                }
            }
        }
        found
    }

    /// Unconfirmed transactions descending from `roots`, roots included
    pub fn unconfirmed_descendants(&self, roots: &[Txid]) -> Vec<Txid> {
        let mut seen: HashSet<Txid> = roots.iter().copied().collect();
        let mut ordered: Vec<Txid> = roots.to_vec();
        let mut queue: VecDeque<Txid> = roots.iter().copied().collect();
        while let Some(txid) = queue.pop_front() {
            let outputs = match self.transactions.get(&txid) {
                Some(record) => record.transaction.outputs.len() as u32,
                None => continue,
            };
            for vout in 0..outputs {
                if let Some(child) = self.spender(&OutPoint::new(txid, vout)) {
                    if child.is_unconfirmed() && seen.insert(child.txid) {
                        ordered.push(child.txid);
                        queue.push_back(child.txid);
                    }
                }
            }
        }
        ordered
    }
}
