//! Change tracker
//!
//! Folds confirmed and unconfirmed transaction events into three streams
//! per scheme (confirmed, unconfirmed, replaced) and answers incremental
//! queries against bookmarks issued from those streams.
//!
//! The unconfirmed stream is rewritten, under a new epoch, whenever a
//! transaction leaves the mempool (confirmation, replacement, eviction or
//! reorg). The confirmed stream is rewritten when a reorg disconnects one
//! of its blocks. Rewrites invalidate older bookmarks, so callers holding
//! them receive a full resync.
//!
//! Store layout:
//! - `t/<txid>` → [`TrackedTransaction`]
//! - `c/<height>` → [`BlockRef`]

use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use super::bookmark::Bookmark;
use super::changes::{
    MatchedInput, MatchedOutput, TransactionChangeSet, TransactionChanges, TransactionEntry,
    TransactionInfo, TransactionQuery, UtxoChangeSet, UtxoChanges, UtxoEntry, UtxoQuery,
};
use super::ledger::{BlockRef, Ledger, OutputMatch, TrackedTransaction, TxStatus};
use super::notifications::{Notifier, TrackerNotification};
use super::stream::{EventStream, StreamEvent};
use crate::core::{BlockHash, OutPoint, Transaction, Txid};
use crate::sequencer::{sort_by_spends, CycleError};
use crate::storage::{scan_json, KvStore, StorageError, WriteBatch};

/// Tracker errors
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transaction ordering failed: {0}")]
    Cycle(#[from] CycleError),
    #[error("Transaction {txid} double-spends confirmed transaction {conflict}")]
    DoubleSpend { txid: Txid, conflict: Txid },
}

/// Tracker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// How long a long-polling query waits for changes
    pub long_poll_timeout: Duration,
    /// Buffered notifications per subscriber
    pub notification_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout: Duration::from_secs(10),
            notification_capacity: 100,
        }
    }
}

fn tx_key(txid: &Txid) -> Vec<u8> {
    let mut key = b"t/".to_vec();
    key.extend_from_slice(txid.as_bytes());
    key
}

fn block_key(height: u32) -> Vec<u8> {
    let mut key = b"c/".to_vec();
    key.extend_from_slice(&height.to_be_bytes());
    key
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Confirmed,
    Unconfirmed,
    Replaced,
}

impl View {
    fn admits(&self, record: &TrackedTransaction) -> bool {
        match self {
            View::Confirmed => record.is_confirmed(),
            View::Unconfirmed => record.is_unconfirmed(),
            View::Replaced => record.replaced_by().is_some(),
        }
    }
}

// =============================================================================
// Per-scheme State
// =============================================================================

struct SchemeStreams {
    confirmed: EventStream,
    unconfirmed: EventStream,
    replaced: EventStream,
}

struct SchemeSlot {
    streams: Mutex<SchemeStreams>,
    /// Bumped after every change to the streams
    version: watch::Sender<u64>,
}

/// Events a transaction contributes to one scheme's stream
fn transaction_events(ledger: &Ledger, record: &TrackedTransaction, scheme: &str) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::Transaction(record.txid)];
    events.extend(
        ledger
            .owned_inputs(&record.transaction, scheme)
            .into_iter()
            .map(|(outpoint, _)| StreamEvent::Spent(outpoint)),
    );
    events.extend(
        record
            .matches
            .iter()
            .filter(|m| m.scheme == scheme)
            .map(|m| StreamEvent::Received(OutPoint::new(record.txid, m.vout))),
    );
    events
}

/// Records of `scheme` admitted by `view`, parents first
fn ordered_records<'a>(
    ledger: &'a Ledger,
    scheme: &str,
    view: View,
) -> Result<Vec<&'a TrackedTransaction>, CycleError> {
    let mut records: Vec<&TrackedTransaction> = ledger
        .transactions()
        .filter(|r| r.schemes.contains(scheme) && view.admits(r))
        .collect();
    records.sort_by_key(|r| (r.block().map(|b| b.height), r.first_seen, r.txid));
    sort_by_spends(records, |r| &r.transaction)
}

fn stream_events(ledger: &Ledger, scheme: &str, view: View) -> Result<Vec<StreamEvent>, CycleError> {
    let records = ordered_records(ledger, scheme, view)?;
    Ok(match view {
        View::Replaced => records
            .iter()
            .filter_map(|r| {
                r.replaced_by().map(|by| StreamEvent::Replaced { txid: r.txid, by })
            })
            .collect(),
        _ => records
            .iter()
            .flat_map(|r| transaction_events(ledger, r, scheme))
            .collect(),
    })
}

fn build_streams(ledger: &Ledger, scheme: &str) -> Result<SchemeStreams, CycleError> {
    Ok(SchemeStreams {
        confirmed: EventStream::new(stream_events(ledger, scheme, View::Confirmed)?),
        unconfirmed: EventStream::new(stream_events(ledger, scheme, View::Unconfirmed)?),
        replaced: EventStream::new(stream_events(ledger, scheme, View::Replaced)?),
    })
}

/// Pending mutation of the ledger and the streams
#[derive(Default)]
struct Plan {
    upserts: Vec<TrackedTransaction>,
    removals: Vec<Txid>,
    blocks_added: Vec<BlockRef>,
    blocks_removed: Vec<u32>,
    confirmed_appends: Vec<Txid>,
    unconfirmed_appends: Vec<Txid>,
    replacements: Vec<(Txid, Txid)>,
    rewrite_confirmed: BTreeSet<String>,
    rewrite_unconfirmed: BTreeSet<String>,
    notifications: Vec<TrackerNotification>,
}

impl Plan {
    fn is_empty(&self) -> bool {
        self.upserts.is_empty()
            && self.removals.is_empty()
            && self.blocks_added.is_empty()
            && self.blocks_removed.is_empty()
    }
}

// =============================================================================
// Change Tracker
// =============================================================================

/// Per-scheme change streams over the tracked transactions
pub struct ChangeTracker {
    store: Arc<dyn KvStore>,
    config: TrackerConfig,
    ledger: RwLock<Ledger>,
    slots: RwLock<HashMap<String, Arc<SchemeSlot>>>,
    notifier: Notifier,
}

impl ChangeTracker {
    /// Open a tracker, reloading tracked transactions from `store`
    ///
    /// Streams start fresh epochs, so bookmarks from a previous run resync.
    pub fn open(store: Arc<dyn KvStore>, config: TrackerConfig) -> Result<Self, TrackerError> {
        let mut ledger = Ledger::default();
        for (_, block) in scan_json::<BlockRef>(store.as_ref(), b"c/")? {
            ledger.set_block(block);
        }
        let records = scan_json::<TrackedTransaction>(store.as_ref(), b"t/")?;
        let count = records.len();
        for (_, record) in records {
            ledger.attach(record);
        }
        if count > 0 {
            log::info!(
                "Loaded {} tracked transactions, tip height {:?}",
                count,
                ledger.current_height()
            );
        }

        Ok(Self {
            store,
            config,
            ledger: RwLock::new(ledger),
            slots: RwLock::new(HashMap::new()),
            notifier: Notifier::new(config.notification_capacity),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Subscribe to block and transaction notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerNotification> {
        self.notifier.subscribe()
    }

    pub fn tip(&self) -> Option<BlockRef> {
        self.ledger.read().unwrap_or_else(|e| e.into_inner()).tip()
    }

    pub fn current_height(&self) -> Option<u32> {
        self.tip().map(|tip| tip.height)
    }

    fn slot(&self, scheme: &str) -> Result<Arc<SchemeSlot>, TrackerError> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(scheme)
        {
            return Ok(slot.clone());
        }
        // Built under the ledger read lock so no ingestion is missed
        let ledger = self.ledger.read().unwrap_or_else(|e| e.into_inner());
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get(scheme) {
            return Ok(slot.clone());
        }
        let (version, _) = watch::channel(0);
        let slot = Arc::new(SchemeSlot {
            streams: Mutex::new(build_streams(&ledger, scheme)?),
            version,
        });
        slots.insert(scheme.to_string(), slot.clone());
        Ok(slot)
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    fn valid_matches(transaction: &Transaction, txid: &Txid, matches: Vec<OutputMatch>) -> Vec<OutputMatch> {
        let mut seen = HashSet::new();
        matches
            .into_iter()
            .filter(|m| {
                if (m.vout as usize) >= transaction.outputs.len() {
                    log::warn!("Dropping match for missing output {}:{}", txid, m.vout);
                    return false;
                }
                seen.insert(m.vout)
            })
            .collect()
    }

    /// Mark unconfirmed conflicts and their descendants as replaced by `by`
    fn plan_replacement(ledger: &Ledger, conflicts: &[Txid], by: Txid, plan: &mut Plan) {
        let roots: Vec<Txid> = conflicts
            .iter()
            .filter(|txid| ledger.get(txid).map_or(false, |r| r.is_unconfirmed()))
            .copied()
            .collect();
        for txid in ledger.unconfirmed_descendants(&roots) {
            if let Some(record) = ledger.get(&txid) {
                let mut replaced = record.clone();
                replaced.status = TxStatus::Replaced { by };
                plan.rewrite_unconfirmed.extend(replaced.schemes.iter().cloned());
                plan.replacements.push((txid, by));
                plan.upserts.push(replaced);
                log::info!("Transaction {} replaced by {}", txid, by);
            }
        }
    }

    /// Disconnect `blocks`, returning their transactions to the mempool
    fn plan_disconnect(ledger: &Ledger, blocks: &[BlockRef], plan: &mut Plan) -> Vec<Txid> {
        let mut returned = Vec::new();
        for block in blocks {
            if ledger.block_height(&block.hash) == Some(block.height) {
                plan.blocks_removed.push(block.height);
            }
            for txid in ledger.transactions_in_block(&block.hash) {
                if let Some(record) = ledger.get(&txid) {
                    let mut unconfirmed = record.clone();
                    unconfirmed.status = TxStatus::Unconfirmed;
                    plan.rewrite_confirmed.extend(unconfirmed.schemes.iter().cloned());
                    plan.rewrite_unconfirmed.extend(unconfirmed.schemes.iter().cloned());
                    plan.upserts.push(unconfirmed);
                    returned.push(txid);
                }
            }
            log::info!("Disconnected block {} at height {}", block.hash, block.height);
        }
        returned
    }

    /// Persist a plan, then apply it to the ledger and the live streams
    fn commit(&self, ledger: &mut Ledger, plan: Plan) -> Result<(), TrackerError> {
        if plan.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        for record in &plan.upserts {
            batch.put_json(tx_key(&record.txid), record)?;
        }
        for txid in &plan.removals {
            batch.delete(tx_key(txid));
        }
        for height in &plan.blocks_removed {
            batch.delete(block_key(*height));
        }
        for block in &plan.blocks_added {
            batch.put_json(block_key(block.height), block)?;
        }
        self.store.write(batch)?;

        let mut touched: BTreeSet<String> = BTreeSet::new();
        touched.extend(plan.rewrite_confirmed.iter().cloned());
        touched.extend(plan.rewrite_unconfirmed.iter().cloned());
        for record in &plan.upserts {
            touched.extend(record.schemes.iter().cloned());
        }
        for txid in &plan.removals {
            if let Some(record) = ledger.get(txid) {
                touched.extend(record.schemes.iter().cloned());
            }
        }

        for height in &plan.blocks_removed {
            ledger.remove_block(*height);
        }
        for block in &plan.blocks_added {
            ledger.set_block(*block);
        }
        for txid in &plan.removals {
            ledger.detach(txid);
        }
        for record in plan.upserts {
            ledger.attach(record);
        }

        for scheme in &touched {
            let slot = match self
                .slots
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(scheme)
            {
                Some(slot) => slot.clone(),
                None => continue,
            };
            let updated = {
                let mut streams = slot.streams.lock().unwrap_or_else(|e| e.into_inner());
                Self::update_streams(
                    ledger,
                    scheme,
                    &mut streams,
                    &plan.confirmed_appends,
                    &plan.unconfirmed_appends,
                    &plan.replacements,
                    plan.rewrite_confirmed.contains(scheme),
                    plan.rewrite_unconfirmed.contains(scheme),
                )
            };
            if let Err(e) = updated {
                // Rebuilt from the ledger on next access
                log::warn!("Dropping streams of {}: {}", scheme, e);
                self.slots
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(scheme);
            }
            slot.version.send_modify(|version| *version += 1);
        }

        for notification in plan.notifications {
            self.notifier.broadcast(notification);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn update_streams(
        ledger: &Ledger,
        scheme: &str,
        streams: &mut SchemeStreams,
        confirmed_appends: &[Txid],
        unconfirmed_appends: &[Txid],
        replacements: &[(Txid, Txid)],
        rewrite_confirmed: bool,
        rewrite_unconfirmed: bool,
    ) -> Result<(), CycleError> {
        let appended = |txids: &[Txid], view: View| -> Vec<StreamEvent> {
            txids
                .iter()
                .filter_map(|txid| ledger.get(txid))
                .filter(|r| r.schemes.contains(scheme) && view.admits(r))
                .flat_map(|r| transaction_events(ledger, r, scheme))
                .collect()
        };

        if rewrite_confirmed {
            streams
                .confirmed
                .rewrite(stream_events(ledger, scheme, View::Confirmed)?);
        } else {
            streams
                .confirmed
                .append(appended(confirmed_appends, View::Confirmed));
        }

        if rewrite_unconfirmed {
            streams
                .unconfirmed
                .rewrite(stream_events(ledger, scheme, View::Unconfirmed)?);
        } else {
            streams
                .unconfirmed
                .append(appended(unconfirmed_appends, View::Unconfirmed));
        }

        streams.replaced.append(
            replacements
                .iter()
                .filter(|(txid, _)| ledger.get(txid).map_or(false, |r| r.schemes.contains(scheme)))
                .map(|(txid, by)| StreamEvent::Replaced {
                    txid: *txid,
                    by: *by,
                }),
        );
        Ok(())
    }

    /// Move the chain tip to (hash, height)
    ///
    /// A different block already known at or above `height` is
    /// disconnected first.
    pub fn on_new_block(&self, hash: BlockHash, height: u32) -> Result<(), TrackerError> {
        let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
        let block = BlockRef { hash, height };
        if ledger.block_height(&hash) == Some(height) {
            return Ok(());
        }

        let mut plan = Plan::default();
        let stale = ledger.blocks_from(height);
        if !stale.is_empty() {
            log::warn!(
                "Block {} at height {} replaces {} known block(s)",
                hash,
                height,
                stale.len()
            );
            Self::plan_disconnect(&ledger, &stale, &mut plan);
        }
        plan.blocks_added.push(block);
        plan.notifications
            .push(TrackerNotification::NewBlock { hash, height });
        self.commit(&mut ledger, plan)?;
        log::info!("New block {} at height {}", hash, height);
        Ok(())
    }

    /// Record a mempool transaction
    ///
    /// Conflicting unconfirmed transactions are replaced. Returns whether
    /// the transaction itself was recorded.
    pub fn record_unconfirmed(
        &self,
        transaction: Transaction,
        matches: Vec<OutputMatch>,
    ) -> Result<bool, TrackerError> {
        let txid = transaction.txid();
        let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
        if ledger.get(&txid).map_or(false, |r| r.is_active()) {
            return Ok(false);
        }

        let conflicts = ledger.conflicts(&transaction, &txid);
        if let Some(confirmed) = conflicts
            .iter()
            .find(|c| ledger.get(c).map_or(false, |r| r.is_confirmed()))
        {
            log::warn!(
                "Ignoring mempool transaction {} spending outputs of confirmed {}",
                txid,
                confirmed
            );
            return Ok(false);
        }

        let mut plan = Plan::default();
        Self::plan_replacement(&ledger, &conflicts, txid, &mut plan);

        let matches = Self::valid_matches(&transaction, &txid, matches);
        let mut schemes: BTreeSet<String> = matches.iter().map(|m| m.scheme.clone()).collect();
        schemes.extend(ledger.input_schemes(&transaction));

        let recorded = !schemes.is_empty();
        if recorded {
            let first_seen = ledger.get(&txid).map_or_else(Utc::now, |r| r.first_seen);
            for scheme in &schemes {
                plan.notifications.push(TrackerNotification::NewTransaction {
                    scheme: scheme.clone(),
                    txid,
                    confirmed: false,
                });
            }
            plan.upserts.push(TrackedTransaction {
                txid,
                transaction,
                first_seen,
                status: TxStatus::Unconfirmed,
                matches,
                schemes,
            });
            plan.unconfirmed_appends.push(txid);
            log::debug!("Recorded unconfirmed transaction {}", txid);
        }
        self.commit(&mut ledger, plan)?;
        Ok(recorded)
    }

    /// Record a transaction confirmed in `block`
    ///
    /// Unconfirmed transactions it conflicts with are replaced by it.
    /// Returns whether anything was recorded.
    pub fn record_confirmed(
        &self,
        transaction: Transaction,
        matches: Vec<OutputMatch>,
        block: BlockRef,
    ) -> Result<bool, TrackerError> {
        let txid = transaction.txid();
        let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
        let existing = ledger.get(&txid).cloned();
        if existing.as_ref().and_then(|r| r.block()) == Some(block) {
            return Ok(false);
        }

        let conflicts = ledger.conflicts(&transaction, &txid);
        if let Some(confirmed) = conflicts
            .iter()
            .find(|c| ledger.get(c).map_or(false, |r| r.is_confirmed()))
        {
            return Err(TrackerError::DoubleSpend {
                txid,
                conflict: *confirmed,
            });
        }

        let mut plan = Plan::default();
        Self::plan_replacement(&ledger, &conflicts, txid, &mut plan);

        let mut matches = Self::valid_matches(&transaction, &txid, matches);
        let mut schemes: BTreeSet<String> = ledger.input_schemes(&transaction);
        let mut first_seen = Utc::now();
        if let Some(previous) = &existing {
            for known in &previous.matches {
                if !matches.iter().any(|m| m.vout == known.vout) {
                    matches.push(known.clone());
                }
            }
            schemes.extend(previous.schemes.iter().cloned());
            first_seen = previous.first_seen;
        }
        schemes.extend(matches.iter().map(|m| m.scheme.clone()));

        if schemes.is_empty() {
            self.commit(&mut ledger, plan)?;
            return Ok(false);
        }

        match existing.as_ref().map(|r| r.status) {
            Some(TxStatus::Unconfirmed) => {
                plan.rewrite_unconfirmed.extend(schemes.iter().cloned());
                plan.confirmed_appends.push(txid);
            }
            Some(TxStatus::Confirmed { .. }) => {
                plan.rewrite_confirmed.extend(schemes.iter().cloned());
            }
            _ => plan.confirmed_appends.push(txid),
        }
        for scheme in &schemes {
            plan.notifications.push(TrackerNotification::NewTransaction {
                scheme: scheme.clone(),
                txid,
                confirmed: true,
            });
        }
        plan.upserts.push(TrackedTransaction {
            txid,
            transaction,
            first_seen,
            status: TxStatus::Confirmed { block },
            matches,
            schemes,
        });
        self.commit(&mut ledger, plan)?;
        log::debug!("Recorded transaction {} in block {}", txid, block.hash);
        Ok(true)
    }

    /// Disconnect a block and every block above it
    ///
    /// Their transactions return to the unconfirmed set; confirmed
    /// bookmarks of the affected schemes stop resolving.
    pub fn on_reorg(&self, hash: BlockHash) -> Result<Vec<Txid>, TrackerError> {
        let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
        let blocks = match ledger.block_height(&hash) {
            Some(height) => ledger.blocks_from(height),
            None => ledger
                .transactions_in_block(&hash)
                .first()
                .and_then(|txid| ledger.get(txid))
                .and_then(|r| r.block())
                .into_iter()
                .collect(),
        };
        if blocks.is_empty() {
            log::warn!("Reorg of unknown block {}", hash);
            return Ok(Vec::new());
        }

        let mut plan = Plan::default();
        let returned = Self::plan_disconnect(&ledger, &blocks, &mut plan);
        self.commit(&mut ledger, plan)?;
        log::info!(
            "Reorg of {} returned {} transaction(s) to the mempool",
            hash,
            returned.len()
        );
        Ok(returned)
    }

    /// Forget a mempool transaction and its descendants
    pub fn on_evicted(&self, txid: Txid) -> Result<bool, TrackerError> {
        let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
        if !ledger.get(&txid).map_or(false, |r| r.is_unconfirmed()) {
            return Ok(false);
        }
        let mut plan = Plan::default();
        for victim in ledger.unconfirmed_descendants(&[txid]) {
            if let Some(record) = ledger.get(&victim) {
                plan.rewrite_unconfirmed.extend(record.schemes.iter().cloned());
            }
            plan.removals.push(victim);
        }
        self.commit(&mut ledger, plan)?;
        log::info!("Evicted transaction {} from the mempool", txid);
        Ok(true)
    }

    /// Drop all tracking state of a scheme
    pub fn forget(&self, scheme: &str) -> Result<(), TrackerError> {
        let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
        let mut plan = Plan::default();
        for record in ledger.transactions().filter(|r| r.schemes.contains(scheme)) {
            let mut kept = record.clone();
            kept.schemes.remove(scheme);
            kept.matches.retain(|m| m.scheme != scheme);
            if kept.schemes.is_empty() {
                plan.removals.push(kept.txid);
            } else {
                plan.upserts.push(kept);
            }
        }
        self.commit(&mut ledger, plan)?;
        if let Some(slot) = self
            .slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(scheme)
        {
            slot.version.send_modify(|version| *version += 1);
        }
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Tracked transaction by id
    pub fn get_transaction(&self, txid: &Txid) -> Option<TransactionInfo> {
        let ledger = self.ledger.read().unwrap_or_else(|e| e.into_inner());
        ledger.get(txid).map(|record| TransactionInfo {
            txid: record.txid,
            transaction: record.transaction.clone(),
            block_hash: record.block().map(|b| b.hash),
            height: record.block().map(|b| b.height),
            confirmations: ledger.confirmations(&record.status),
            timestamp: record.first_seen,
            replaced_by: record.replaced_by(),
        })
    }

    /// UTXO changes of `scheme` since the query's bookmarks
    pub async fn get_utxos(
        &self,
        scheme: &str,
        query: UtxoQuery,
    ) -> Result<UtxoChanges, TrackerError> {
        let slot = self.slot(scheme)?;
        let version = slot.version.subscribe();
        let changes = self.utxo_changes(&slot, &query)?;
        if !query.long_polling || changes.has_changes() {
            return Ok(changes);
        }
        self.long_poll(
            scheme,
            slot,
            version,
            changes,
            |slot| self.utxo_changes(slot, &query),
            UtxoChanges::has_changes,
        )
        .await
    }

    /// Transaction changes of `scheme` since the query's bookmarks
    pub async fn get_transactions(
        &self,
        scheme: &str,
        query: TransactionQuery,
    ) -> Result<TransactionChanges, TrackerError> {
        let slot = self.slot(scheme)?;
        let version = slot.version.subscribe();
        let changes = self.transaction_changes(&slot, scheme, &query)?;
        if !query.long_polling || changes.has_changes() {
            return Ok(changes);
        }
        self.long_poll(
            scheme,
            slot,
            version,
            changes,
            |slot| self.transaction_changes(slot, scheme, &query),
            TransactionChanges::has_changes,
        )
        .await
    }

    /// Recompute on every stream change until `ready` or the timeout.
    ///
    /// The slot is looked up again after each wake: a slot dropped by a
    /// failed stream update is replaced, and later events only bump the
    /// replacement's version.
    async fn long_poll<T, C, R>(
        &self,
        scheme: &str,
        mut slot: Arc<SchemeSlot>,
        mut version: watch::Receiver<u64>,
        initial: T,
        mut compute: C,
        ready: R,
    ) -> Result<T, TrackerError>
    where
        C: FnMut(&SchemeSlot) -> Result<T, TrackerError>,
        R: Fn(&T) -> bool,
    {
        let deadline = tokio::time::Instant::now() + self.config.long_poll_timeout;
        let mut current = initial;
        loop {
            match tokio::time::timeout_at(deadline, version.changed()).await {
                Ok(Ok(())) => {
                    let latest = self.slot(scheme)?;
                    if !Arc::ptr_eq(&latest, &slot) {
                        version = latest.version.subscribe();
                        slot = latest;
                    }
                    current = compute(slot.as_ref())?;
                    if ready(&current) {
                        return Ok(current);
                    }
                }
                // Timed out, or the scheme was dropped
                Ok(Err(_)) | Err(_) => return Ok(current),
            }
        }
    }

    fn utxo_changes(&self, slot: &SchemeSlot, query: &UtxoQuery) -> Result<UtxoChanges, TrackerError> {
        let ledger = self.ledger.read().unwrap_or_else(|e| e.into_inner());
        let streams = slot.streams.lock().unwrap_or_else(|e| e.into_inner());
        Ok(UtxoChanges {
            current_height: ledger.current_height(),
            confirmed: utxo_delta(&ledger, &streams.confirmed, query.confirmed_bookmark, true)?,
            unconfirmed: utxo_delta(
                &ledger,
                &streams.unconfirmed,
                query.unconfirmed_bookmark,
                false,
            )?,
        })
    }

    fn transaction_changes(
        &self,
        slot: &SchemeSlot,
        scheme: &str,
        query: &TransactionQuery,
    ) -> Result<TransactionChanges, TrackerError> {
        let ledger = self.ledger.read().unwrap_or_else(|e| e.into_inner());
        let streams = slot.streams.lock().unwrap_or_else(|e| e.into_inner());
        let delta = |stream: &EventStream, bookmark, view| {
            transaction_delta(
                &ledger,
                stream,
                bookmark,
                scheme,
                view,
                query.include_transaction,
            )
        };
        Ok(TransactionChanges {
            current_height: ledger.current_height(),
            confirmed: delta(&streams.confirmed, query.confirmed_bookmark, View::Confirmed)?,
            unconfirmed: delta(
                &streams.unconfirmed,
                query.unconfirmed_bookmark,
                View::Unconfirmed,
            )?,
            replaced: delta(&streams.replaced, query.replaced_bookmark, View::Replaced)?,
        })
    }
}

/// Ids of `txids` ordered parents first
fn sorted_txids(ledger: &Ledger, txids: &[Txid]) -> Result<Vec<Txid>, CycleError> {
    let records: Vec<&TrackedTransaction> = txids.iter().filter_map(|t| ledger.get(t)).collect();
    Ok(sort_by_spends(records, |r| &r.transaction)?
        .into_iter()
        .map(|r| r.txid)
        .collect())
}

fn utxo_delta(
    ledger: &Ledger,
    stream: &EventStream,
    bookmark: Option<Bookmark>,
    confirmed_view: bool,
) -> Result<UtxoChangeSet, CycleError> {
    let window = stream.window(bookmark);
    let received: HashSet<OutPoint> = window
        .events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Received(outpoint) => Some(*outpoint),
            _ => None,
        })
        .collect();

    let mut txids = Vec::new();
    let mut utxos = Vec::new();
    let mut spent: Vec<OutPoint> = Vec::new();
    for event in window.events {
        match event {
            StreamEvent::Transaction(txid) => txids.push(*txid),
            StreamEvent::Received(outpoint) => {
                if ledger.is_spent(outpoint, confirmed_view) {
                    continue;
                }
                let (owned, record) = match (ledger.owner(outpoint), ledger.get(&outpoint.txid)) {
                    (Some(owned), Some(record)) => (owned, record),
                    _ => continue,
                };
                utxos.push(UtxoEntry {
                    outpoint: *outpoint,
                    value: owned.value,
                    script_pubkey: owned.script_pubkey.clone(),
                    key_path: owned.key_path,
                    timestamp: record.first_seen,
                    confirmations: ledger.confirmations(&record.status),
                });
            }
            StreamEvent::Spent(outpoint) => {
                // Coins received and spent inside the window net out
                if !received.contains(outpoint) && !spent.contains(outpoint) {
                    spent.push(*outpoint);
                }
            }
            StreamEvent::Replaced { .. } => {}
        }
    }

    let rank: HashMap<Txid, usize> = sorted_txids(ledger, &txids)?
        .into_iter()
        .enumerate()
        .map(|(position, txid)| (txid, position))
        .collect();
    utxos.sort_by_key(|u| {
        (
            rank.get(&u.outpoint.txid).copied().unwrap_or(usize::MAX),
            u.outpoint.vout,
        )
    });

    if window.reset {
        log::debug!("Unknown bookmark, returning a full resync");
    }
    Ok(UtxoChangeSet {
        bookmark: stream.bookmark(),
        known_bookmark: window.known,
        // A stale bookmark is a change even with an empty set: the caller
        // must drop what it holds from the discarded epoch
        has_changes: !utxos.is_empty() || !spent.is_empty() || window.reset,
        utxos,
        spent_outpoints: spent,
    })
}

fn transaction_entry(
    ledger: &Ledger,
    record: &TrackedTransaction,
    scheme: &str,
    include_transaction: bool,
) -> TransactionEntry {
    let outputs: Vec<MatchedOutput> = record
        .matches
        .iter()
        .filter(|m| m.scheme == scheme)
        .filter_map(|m| {
            record
                .transaction
                .outputs
                .get(m.vout as usize)
                .map(|output| MatchedOutput {
                    index: m.vout,
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    key_path: m.key_path,
                })
        })
        .collect();
    let inputs: Vec<MatchedInput> = ledger
        .owned_inputs(&record.transaction, scheme)
        .into_iter()
        .map(|(outpoint, owned)| MatchedInput {
            outpoint,
            value: owned.value,
            key_path: owned.key_path,
        })
        .collect();
    let received: i64 = outputs.iter().map(|o| o.value as i64).sum();
    let sent: i64 = inputs.iter().map(|i| i.value as i64).sum();

    TransactionEntry {
        txid: record.txid,
        block_hash: record.block().map(|b| b.hash),
        height: record.block().map(|b| b.height),
        confirmations: ledger.confirmations(&record.status),
        timestamp: record.first_seen,
        outputs,
        inputs,
        balance_change: received - sent,
        replaced_by: record.replaced_by(),
        transaction: include_transaction.then(|| record.transaction.clone()),
    }
}

fn transaction_delta(
    ledger: &Ledger,
    stream: &EventStream,
    bookmark: Option<Bookmark>,
    scheme: &str,
    view: View,
    include_transaction: bool,
) -> Result<TransactionChangeSet, CycleError> {
    let window = stream.window(bookmark);
    let mut txids: Vec<Txid> = Vec::new();
    for event in window.events {
        let txid = match (view, event) {
            (View::Replaced, StreamEvent::Replaced { txid, .. }) => *txid,
            (View::Confirmed | View::Unconfirmed, StreamEvent::Transaction(txid)) => *txid,
            _ => continue,
        };
        if !txids.contains(&txid) && ledger.get(&txid).map_or(false, |r| view.admits(r)) {
            txids.push(txid);
        }
    }

    let transactions: Vec<TransactionEntry> = sorted_txids(ledger, &txids)?
        .iter()
        .filter_map(|txid| ledger.get(txid))
        .map(|record| transaction_entry(ledger, record, scheme, include_transaction))
        .collect();

    Ok(TransactionChangeSet {
        bookmark: stream.bookmark(),
        known_bookmark: window.known,
        // Stale bookmarks count as a change, as for UTXOs
        has_changes: !transactions.is_empty() || window.reset,
        transactions,
    })
}

// =============================================================================
// Tests
// =============================================================================
