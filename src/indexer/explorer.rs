//! Explorer
//!
//! Entry point for the blockchain watcher and for API callers. Incoming
//! transactions are classified against the key repository, gap windows
//! are advanced for every used script, and the classified transaction
//! is handed to the change tracker.

use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use super::config::ExplorerConfig;
use crate::core::{BlockHash, Network, Script, Transaction, Txid};
use crate::derivation::{DerivationScheme, Feature, SchemeParseError, SchemeParser};
use crate::repository::{KeyPath, KeyPathEntry, KeyRepository, RepositoryError};
use crate::sequencer::{sort_transactions, CycleError};
use crate::storage::{FileStore, KvStore, StorageError};
use crate::tracker::{
    BlockRef, ChangeTracker, OutputMatch, TrackerError, TrackerNotification, TransactionChanges,
    TransactionInfo, TransactionQuery, UtxoChanges, UtxoQuery,
};

/// Indexer errors
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("Invalid derivation scheme: {0}")]
    Scheme(#[from] SchemeParseError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transaction ordering failed: {0}")]
    Cycle(#[from] CycleError),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid configuration file: {0}")]
    ConfigFormat(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Key repository and change tracker over one store
pub struct Explorer {
    config: ExplorerConfig,
    parser: SchemeParser,
    repository: KeyRepository,
    tracker: ChangeTracker,
}

impl Explorer {
    /// Open the file store under `config.data_dir`
    pub fn open(config: ExplorerConfig) -> Result<Self, IndexerError> {
        let store = FileStore::open(&config.storage())?;
        log::info!("Using store {}", store.path().display());
        Self::with_store(Arc::new(store), config)
    }

    pub fn with_store(store: Arc<dyn KvStore>, config: ExplorerConfig) -> Result<Self, IndexerError> {
        let repository = KeyRepository::open(store.clone(), config.network, config.repository());
        let tracker = ChangeTracker::open(store, config.tracker())?;
        Ok(Self {
            parser: SchemeParser::new(config.network),
            config,
            repository,
            tracker,
        })
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn repository(&self) -> &KeyRepository {
        &self.repository
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn parse_scheme(&self, input: &str) -> Result<DerivationScheme, IndexerError> {
        Ok(self.parser.parse(input)?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerNotification> {
        self.tracker.subscribe()
    }

    // =========================================================================
    // Tracking
    // =========================================================================

    pub fn track(&self, scheme: &DerivationScheme) -> Result<(), IndexerError> {
        self.repository.track(scheme)?;
        Ok(())
    }

    /// Stop tracking and drop the scheme's history
    pub fn untrack(&self, scheme: &DerivationScheme) -> Result<bool, IndexerError> {
        let removed = self.repository.untrack(scheme)?;
        self.tracker.forget(scheme.as_str())?;
        Ok(removed)
    }

    fn ensure_tracked(&self, scheme: &DerivationScheme) -> Result<(), IndexerError> {
        if self.repository.is_tracked(scheme)? {
            Ok(())
        } else {
            Err(RepositoryError::NotTracked(scheme.to_string()).into())
        }
    }

    // =========================================================================
    // Watcher Events
    // =========================================================================

    /// Match outputs against the index and mark their keys as used
    fn classify(&self, transaction: &Transaction) -> Result<Vec<OutputMatch>, IndexerError> {
        let mut entries: Vec<KeyPathEntry> = Vec::new();
        let mut matches = Vec::new();
        for (vout, output) in transaction.outputs.iter().enumerate() {
            if let Some(entry) = self.repository.get_key_information(&output.script_pubkey)? {
                matches.push(OutputMatch {
                    scheme: entry.scheme.clone(),
                    vout: vout as u32,
                    key_path: entry.key_path,
                });
                entries.push(entry);
            }
        }
        if !entries.is_empty() {
            self.repository.mark_as_used(&entries)?;
        }
        Ok(matches)
    }

    pub fn on_new_block(&self, hash: BlockHash, height: u32) -> Result<(), IndexerError> {
        self.tracker.on_new_block(hash, height)?;
        Ok(())
    }

    /// Record a transaction mined in (hash, height)
    pub fn on_confirmed_transaction(
        &self,
        transaction: Transaction,
        hash: BlockHash,
        height: u32,
    ) -> Result<bool, IndexerError> {
        let matches = self.classify(&transaction)?;
        Ok(self
            .tracker
            .record_confirmed(transaction, matches, BlockRef { hash, height })?)
    }

    /// Connect a block and record its transactions, parents first
    ///
    /// Returns how many transactions were relevant.
    pub fn on_block(
        &self,
        hash: BlockHash,
        height: u32,
        transactions: Vec<Transaction>,
    ) -> Result<usize, IndexerError> {
        self.on_new_block(hash, height)?;
        let mut recorded = 0;
        for transaction in sort_transactions(transactions)? {
            if self.on_confirmed_transaction(transaction, hash, height)? {
                recorded += 1;
            }
        }
        log::debug!("Block {} carried {} relevant transaction(s)", hash, recorded);
        Ok(recorded)
    }

    pub fn on_unconfirmed_transaction(&self, transaction: Transaction) -> Result<bool, IndexerError> {
        let matches = self.classify(&transaction)?;
        Ok(self.tracker.record_unconfirmed(transaction, matches)?)
    }

    pub fn on_reorg(&self, hash: BlockHash) -> Result<Vec<Txid>, IndexerError> {
        Ok(self.tracker.on_reorg(hash)?)
    }

    pub fn on_evicted(&self, txid: Txid) -> Result<bool, IndexerError> {
        Ok(self.tracker.on_evicted(txid)?)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_utxos(
        &self,
        scheme: &DerivationScheme,
        query: UtxoQuery,
    ) -> Result<UtxoChanges, IndexerError> {
        self.ensure_tracked(scheme)?;
        Ok(self.tracker.get_utxos(scheme.as_str(), query).await?)
    }

    pub async fn get_transactions(
        &self,
        scheme: &DerivationScheme,
        query: TransactionQuery,
    ) -> Result<TransactionChanges, IndexerError> {
        self.ensure_tracked(scheme)?;
        Ok(self.tracker.get_transactions(scheme.as_str(), query).await?)
    }

    pub fn get_transaction(&self, txid: &Txid) -> Option<TransactionInfo> {
        self.tracker.get_transaction(txid)
    }

    pub fn get_unused(
        &self,
        scheme: &DerivationScheme,
        feature: Feature,
        skip: usize,
        reserve: bool,
    ) -> Result<Option<KeyPathEntry>, IndexerError> {
        Ok(self.repository.get_unused(scheme, feature, skip, reserve)?)
    }

    pub fn cancel_reservation(&self, scheme: &DerivationScheme, key_paths: &[KeyPath]) {
        self.repository.cancel_reservation(scheme, key_paths)
    }

    pub fn get_key_information(&self, script: &Script) -> Result<Option<KeyPathEntry>, IndexerError> {
        Ok(self.repository.get_key_information(script)?)
    }
}

// =============================================================================
// Tests
// =============================================================================
