//! Key repository
//!
//! Maps every materialized script back to its (scheme, feature, index),
//! keeps each (scheme, feature) window `gap_limit` entries ahead of the
//! highest used index and hands out unused entries under reservation.
//!
//! Store layout:
//! - `k/<script bytes>` → [`KeyPathEntry`]
//! - `w/<scheme>/<feature>` → [`GapWindow`]
//! - `s/<scheme>` → [`TrackedScheme`]

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::entry::{required_end, GapWindow, KeyPath, KeyPathEntry, TrackedScheme};
use crate::core::{Network, Script};
use crate::derivation::{DerivationError, DerivationScheme, Feature, SchemeParseError, SchemeParser};
use crate::storage::{get_json, scan_json, KvStore, StorageError, WriteBatch};

/// Repository errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Derivation error: {0}")]
    Derivation(#[from] DerivationError),
    #[error("Stored scheme is invalid: {0}")]
    Scheme(#[from] SchemeParseError),
    #[error("Scheme is not tracked: {0}")]
    NotTracked(String),
    #[error("Scheme belongs to {0}, repository serves {1}")]
    WrongNetwork(Network, Network),
    #[error("Reservation for {key_path} expired")]
    ReservationExpired { scheme: String, key_path: KeyPath },
}

/// Repository configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Unused entries kept materialized past the highest used index
    pub gap_limit: u32,
    /// How long a reservation holds an index
    pub reservation_lease: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            gap_limit: 30,
            reservation_lease: Duration::from_secs(300),
        }
    }
}

type SlotKey = (String, Feature);

/// In-memory state of one (scheme, feature) sequence
#[derive(Debug, Default)]
struct WindowSlot {
    loaded: bool,
    window: Option<GapWindow>,
    /// index → lease expiry
    reservations: BTreeMap<u32, Instant>,
}

impl WindowSlot {
    fn sweep(&mut self, now: Instant) {
        self.reservations.retain(|_, expiry| *expiry > now);
    }
}

fn entry_key(script: &Script) -> Vec<u8> {
    let mut key = b"k/".to_vec();
    key.extend_from_slice(script.as_bytes());
    key
}

fn window_key(scheme: &str, feature: Feature) -> Vec<u8> {
    format!("w/{}/{}", scheme, feature.index()).into_bytes()
}

fn scheme_key(scheme: &str) -> Vec<u8> {
    format!("s/{}", scheme).into_bytes()
}

// =============================================================================
// Key Repository
// =============================================================================

/// Persistent script index with gap-limit windows and reservations
pub struct KeyRepository {
    store: Arc<dyn KvStore>,
    network: Network,
    config: RepositoryConfig,
    slots: RwLock<HashMap<SlotKey, Arc<Mutex<WindowSlot>>>>,
    schemes: RwLock<HashMap<String, DerivationScheme>>,
}

impl KeyRepository {
    /// Open a repository over `store`; windows load lazily
    pub fn open(store: Arc<dyn KvStore>, network: Network, config: RepositoryConfig) -> Self {
        Self {
            store,
            network,
            config,
            slots: RwLock::new(HashMap::new()),
            schemes: RwLock::new(HashMap::new()),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    fn slot(&self, key: &SlotKey) -> Arc<Mutex<WindowSlot>> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return slot.clone();
        }
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Load a slot's window from the store if this is its first access
    fn ensure_loaded(&self, key: &SlotKey, slot: &mut WindowSlot) -> Result<(), RepositoryError> {
        if !slot.loaded {
            slot.window = get_json(self.store.as_ref(), &window_key(&key.0, key.1))?;
            slot.loaded = true;
        }
        Ok(())
    }

    fn resolve_scheme(&self, canonical: &str) -> Result<DerivationScheme, RepositoryError> {
        if let Some(scheme) = self
            .schemes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(canonical)
        {
            return Ok(scheme.clone());
        }
        let scheme = SchemeParser::new(self.network).parse(canonical)?;
        self.cache_scheme(&scheme);
        Ok(scheme)
    }

    fn cache_scheme(&self, scheme: &DerivationScheme) {
        self.schemes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scheme.as_str().to_string(), scheme.clone());
    }

    fn check_network(&self, scheme: &DerivationScheme) -> Result<(), RepositoryError> {
        if scheme.network() != self.network {
            return Err(RepositoryError::WrongNetwork(scheme.network(), self.network));
        }
        Ok(())
    }

    /// Queue entries for indices in `range` into `batch`
    fn materialize(
        scheme: &DerivationScheme,
        feature: Feature,
        range: std::ops::Range<u32>,
        batch: &mut WriteBatch,
    ) -> Result<(), RepositoryError> {
        if range.is_empty() {
            return Ok(());
        }
        for output in scheme.line(feature)?.derive_range(range)? {
            let entry = KeyPathEntry::from(output);
            batch.put_json(entry_key(&entry.script_pubkey), &entry)?;
        }
        Ok(())
    }

    /// Start tracking a scheme. Idempotent.
    pub fn track(&self, scheme: &DerivationScheme) -> Result<(), RepositoryError> {
        self.check_network(scheme)?;
        self.cache_scheme(scheme);

        let keys: Vec<SlotKey> = Feature::ALL
            .iter()
            .map(|f| (scheme.as_str().to_string(), *f))
            .collect();
        let slots: Vec<_> = keys.iter().map(|k| self.slot(k)).collect();
        let mut guards = lock_all(&slots);

        let mut batch = WriteBatch::new();
        let mut created = Vec::new();
        for (key, guard) in keys.iter().zip(guards.iter_mut()) {
            self.ensure_loaded(key, guard)?;
            if guard.window.is_some() {
                continue;
            }
            let end = required_end(None, self.config.gap_limit);
            Self::materialize(scheme, key.1, 0..end, &mut batch)?;
            let window = GapWindow {
                highest_generated: end - 1,
                highest_used: None,
            };
            batch.put_json(window_key(&key.0, key.1), &window)?;
            created.push((key.1, window));
        }

        if created.is_empty() {
            return Ok(());
        }
        let record = TrackedScheme {
            scheme: scheme.as_str().to_string(),
            tracked_at: Utc::now(),
        };
        batch.put_json(scheme_key(scheme.as_str()), &record)?;
        self.store.write(batch)?;

        for (feature, window) in created {
            let index = Feature::ALL.iter().position(|f| *f == feature).unwrap_or(0);
            guards[index].window = Some(window);
        }
        log::info!("Tracking scheme {}", scheme);
        Ok(())
    }

    /// Stop tracking a scheme, deleting its windows and entries
    ///
    /// Returns whether the scheme was tracked.
    pub fn untrack(&self, scheme: &DerivationScheme) -> Result<bool, RepositoryError> {
        let keys: Vec<SlotKey> = Feature::ALL
            .iter()
            .map(|f| (scheme.as_str().to_string(), *f))
            .collect();
        let slots: Vec<_> = keys.iter().map(|k| self.slot(k)).collect();
        let mut guards = lock_all(&slots);

        let mut batch = WriteBatch::new();
        let mut tracked = false;
        for (key, guard) in keys.iter().zip(guards.iter_mut()) {
            self.ensure_loaded(key, guard)?;
            if let Some(window) = guard.window {
                tracked = true;
                for output in scheme.line(key.1)?.derive_range(0..window.generated_end())? {
                    batch.delete(entry_key(&output.script_pubkey));
                }
                batch.delete(window_key(&key.0, key.1));
            }
        }
        if !tracked {
            return Ok(false);
        }
        batch.delete(scheme_key(scheme.as_str()));
        self.store.write(batch)?;

        for guard in guards.iter_mut() {
            guard.window = None;
            guard.reservations.clear();
        }
        log::info!("Untracked scheme {}", scheme);
        Ok(true)
    }

    pub fn is_tracked(&self, scheme: &DerivationScheme) -> Result<bool, RepositoryError> {
        Ok(self.store.get(&scheme_key(scheme.as_str()))?.is_some())
    }

    /// Every tracked scheme, ordered by canonical string
    pub fn tracked_schemes(&self) -> Result<Vec<TrackedScheme>, RepositoryError> {
        Ok(scan_json(self.store.as_ref(), b"s/")?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Parsed form of every tracked scheme
    pub fn load_tracked_schemes(&self) -> Result<Vec<DerivationScheme>, RepositoryError> {
        self.tracked_schemes()?
            .iter()
            .map(|record| self.resolve_scheme(&record.scheme))
            .collect()
    }

    /// Current window of (scheme, feature), if tracked
    pub fn window(
        &self,
        scheme: &DerivationScheme,
        feature: Feature,
    ) -> Result<Option<GapWindow>, RepositoryError> {
        let key = (scheme.as_str().to_string(), feature);
        let slot = self.slot(&key);
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_loaded(&key, &mut guard)?;
        Ok(guard.window)
    }

    /// Point lookup of a script in the index
    pub fn get_key_information(
        &self,
        script: &Script,
    ) -> Result<Option<KeyPathEntry>, RepositoryError> {
        Ok(get_json(self.store.as_ref(), &entry_key(script))?)
    }

    /// Record entries as used, advancing windows where the index is new
    ///
    /// Safe to call repeatedly and out of order.
    pub fn mark_as_used(&self, entries: &[KeyPathEntry]) -> Result<(), RepositoryError> {
        let mut highest: BTreeMap<SlotKey, u32> = BTreeMap::new();
        for entry in entries {
            let slot = highest
                .entry((entry.scheme.clone(), entry.feature()))
                .or_insert(entry.index());
            *slot = (*slot).max(entry.index());
        }
        if highest.is_empty() {
            return Ok(());
        }

        // BTreeMap order gives a global lock order across schemes
        let slots: Vec<_> = highest.keys().map(|k| self.slot(k)).collect();
        let mut guards = lock_all(&slots);

        let mut batch = WriteBatch::new();
        let mut updates = Vec::new();
        for (position, ((key, used), guard)) in highest.iter().zip(guards.iter_mut()).enumerate() {
            self.ensure_loaded(key, guard)?;
            let window = match guard.window {
                Some(window) => window,
                None => {
                    log::debug!("Ignoring use of {} on untracked scheme {}", used, key.0);
                    continue;
                }
            };
            if window.highest_used.map_or(false, |current| current >= *used) {
                continue;
            }

            let end = required_end(Some(*used), self.config.gap_limit);
            let start = window.generated_end();
            if end > start {
                let scheme = self.resolve_scheme(&key.0)?;
                Self::materialize(&scheme, key.1, start..end, &mut batch)?;
            }
            let advanced = GapWindow {
                highest_generated: window.highest_generated.max(end - 1),
                highest_used: Some(*used),
            };
            batch.put_json(window_key(&key.0, key.1), &advanced)?;
            updates.push((position, advanced));
        }

        if updates.is_empty() {
            return Ok(());
        }
        self.store.write(batch)?;

        for (position, window) in updates {
            let guard = &mut guards[position];
            if let Some(used) = window.highest_used {
                guard.reservations.retain(|index, _| *index > used);
            }
            log::debug!(
                "Window advanced to used={:?} generated={}",
                window.highest_used,
                window.highest_generated
            );
            guard.window = Some(window);
        }
        Ok(())
    }

    /// Next unused entry of (scheme, feature)
    ///
    /// Returns the `skip`-th index after the highest used one among the
    /// materialized entries. With `reserve`, reserved indices are passed
    /// over and the result is reserved before returning. Never extends
    /// the window.
    pub fn get_unused(
        &self,
        scheme: &DerivationScheme,
        feature: Feature,
        skip: usize,
        reserve: bool,
    ) -> Result<Option<KeyPathEntry>, RepositoryError> {
        let key = (scheme.as_str().to_string(), feature);
        let slot = self.slot(&key);
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_loaded(&key, &mut guard)?;
        let window = guard
            .window
            .ok_or_else(|| RepositoryError::NotTracked(key.0.clone()))?;

        let now = Instant::now();
        guard.sweep(now);
        let candidate = (window.first_unused()..window.generated_end())
            .filter(|index| !reserve || !guard.reservations.contains_key(index))
            .nth(skip);
        let index = match candidate {
            Some(index) => index,
            None => return Ok(None),
        };

        let entry = KeyPathEntry::from(scheme.derive(feature, index)?);
        if reserve {
            guard
                .reservations
                .insert(index, now + self.config.reservation_lease);
            log::debug!("Reserved {} of {}", entry.key_path, scheme);
        }
        Ok(Some(entry))
    }

    /// Release reservations, making the indices eligible again
    pub fn cancel_reservation(&self, scheme: &DerivationScheme, key_paths: &[KeyPath]) {
        for feature in Feature::ALL {
            let indices: Vec<u32> = key_paths
                .iter()
                .filter(|path| path.feature == feature)
                .map(|path| path.index)
                .collect();
            if indices.is_empty() {
                continue;
            }
            let slot = self.slot(&(scheme.as_str().to_string(), feature));
            let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
            for index in indices {
                guard.reservations.remove(&index);
            }
        }
    }

    /// Extend a live reservation by one lease
    pub fn renew_reservation(
        &self,
        scheme: &DerivationScheme,
        key_path: KeyPath,
    ) -> Result<(), RepositoryError> {
        let slot = self.slot(&(scheme.as_str().to_string(), key_path.feature));
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        guard.sweep(now);
        match guard.reservations.get_mut(&key_path.index) {
            Some(expiry) => {
                *expiry = now + self.config.reservation_lease;
                Ok(())
            }
            None => Err(RepositoryError::ReservationExpired {
                scheme: scheme.as_str().to_string(),
                key_path,
            }),
        }
    }
}

fn lock_all(slots: &[Arc<Mutex<WindowSlot>>]) -> Vec<MutexGuard<'_, WindowSlot>> {
    slots
        .iter()
        .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::test_keys;
    use crate::derivation::ScriptKind;
    use crate::storage::{FileStore, MemoryStore, StorageConfig};
    use std::collections::HashSet;

    fn scheme(seed: u8) -> DerivationScheme {
        DerivationScheme::direct(test_keys::xpub(seed), ScriptKind::Segwit, Network::Regtest)
    }

    fn repository() -> KeyRepository {
        KeyRepository::open(
            Arc::new(MemoryStore::new()),
            Network::Regtest,
            RepositoryConfig::default(),
        )
    }

    fn lookup(repo: &KeyRepository, scheme: &DerivationScheme, index: u32) -> Option<KeyPathEntry> {
        let script = scheme.derive(Feature::Deposit, index).unwrap().script_pubkey;
        repo.get_key_information(&script).unwrap()
    }

    /// Store whose writes fail once `broken` is set
    struct FlakyStore {
        inner: MemoryStore,
        broken: std::sync::atomic::AtomicBool,
    }

    impl KvStore for FlakyStore {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key)
        }

        fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
            self.inner.scan_prefix(prefix)
        }

        fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
            if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::Unavailable("disk detached".to_string()));
            }
            self.inner.write(batch)
        }
    }

    #[test]
    fn test_track_materializes_gap_limit() {
        let repo = repository();
        let scheme = scheme(1);
        repo.track(&scheme).unwrap();

        for index in 0..30 {
            let entry = lookup(&repo, &scheme, index).unwrap();
            assert_eq!(entry.key_path, KeyPath::new(Feature::Deposit, index));
            assert_eq!(entry.scheme, scheme.as_str());
        }
        assert!(lookup(&repo, &scheme, 30).is_none());

        let change = scheme.derive(Feature::Change, 29).unwrap().script_pubkey;
        assert!(repo.get_key_information(&change).unwrap().is_some());
        assert!(repo.is_tracked(&scheme).unwrap());
    }

    #[test]
    fn test_track_is_idempotent() {
        let repo = repository();
        let scheme = scheme(1);
        repo.track(&scheme).unwrap();
        let used = lookup(&repo, &scheme, 3).unwrap();
        repo.mark_as_used(&[used]).unwrap();
        repo.track(&scheme).unwrap();

        let window = repo.window(&scheme, Feature::Deposit).unwrap().unwrap();
        assert_eq!(window.highest_used, Some(3));
        assert_eq!(repo.tracked_schemes().unwrap().len(), 1);
    }

    #[test]
    fn test_mark_as_used_extends_window() {
        let repo = repository();
        let scheme = scheme(2);
        repo.track(&scheme).unwrap();

        let used = lookup(&repo, &scheme, 12).unwrap();
        repo.mark_as_used(&[used.clone()]).unwrap();
        for index in 0..42 {
            assert!(lookup(&repo, &scheme, index).is_some(), "index {}", index);
        }
        assert!(lookup(&repo, &scheme, 42).is_none());

        // Stale and repeated uses are no-ops
        let earlier = lookup(&repo, &scheme, 4).unwrap();
        repo.mark_as_used(&[earlier, used]).unwrap();
        let window = repo.window(&scheme, Feature::Deposit).unwrap().unwrap();
        assert_eq!(window.highest_used, Some(12));
        assert_eq!(window.highest_generated, 41);

        // Change subtree is independent
        let change = repo.window(&scheme, Feature::Change).unwrap().unwrap();
        assert_eq!(change.highest_used, None);
    }

    #[test]
    fn test_get_unused_skips_used_indices() {
        let repo = repository();
        let scheme = scheme(3);
        repo.track(&scheme).unwrap();

        let first = repo.get_unused(&scheme, Feature::Deposit, 0, false).unwrap().unwrap();
        assert_eq!(first.index(), 0);

        repo.mark_as_used(&[lookup(&repo, &scheme, 7).unwrap()]).unwrap();
        let next = repo.get_unused(&scheme, Feature::Deposit, 0, false).unwrap().unwrap();
        assert_eq!(next.index(), 8);
        let skipped = repo.get_unused(&scheme, Feature::Deposit, 2, false).unwrap().unwrap();
        assert_eq!(skipped.index(), 10);
        assert_eq!(
            Some(skipped.clone()),
            repo.get_key_information(&skipped.script_pubkey).unwrap()
        );
    }

    #[test]
    fn test_get_unused_does_not_extend_window() {
        let repo = repository();
        let scheme = scheme(3);
        repo.track(&scheme).unwrap();
        assert!(repo.get_unused(&scheme, Feature::Deposit, 29, false).unwrap().is_some());
        assert!(repo.get_unused(&scheme, Feature::Deposit, 30, false).unwrap().is_none());

        for _ in 0..30 {
            assert!(repo.get_unused(&scheme, Feature::Change, 0, true).unwrap().is_some());
        }
        assert!(repo.get_unused(&scheme, Feature::Change, 0, true).unwrap().is_none());
        assert!(lookup(&repo, &scheme, 30).is_none());
    }

    #[test]
    fn test_reservations_bounded_by_gap_limit() {
        let repo = repository();
        let scheme = scheme(13);
        repo.track(&scheme).unwrap();

        let reserved: Vec<u32> = (0..100)
            .map_while(|_| repo.get_unused(&scheme, Feature::Deposit, 0, true).unwrap())
            .map(|entry| entry.index())
            .collect();
        assert_eq!(reserved, (0..30).collect::<Vec<_>>());

        // Using the lowest index opens exactly one more slot
        let used = lookup(&repo, &scheme, 0).unwrap();
        repo.mark_as_used(&[used]).unwrap();
        let next = repo.get_unused(&scheme, Feature::Deposit, 0, true).unwrap().unwrap();
        assert_eq!(next.index(), 30);
        assert!(repo.get_unused(&scheme, Feature::Deposit, 0, true).unwrap().is_none());
    }

    #[test]
    fn test_get_unused_requires_tracking() {
        let repo = repository();
        assert!(matches!(
            repo.get_unused(&scheme(4), Feature::Deposit, 0, false),
            Err(RepositoryError::NotTracked(_))
        ));
    }

    #[test]
    fn test_concurrent_reservations_are_distinct() {
        let repo = repository();
        let scheme = scheme(5);
        repo.track(&scheme).unwrap();

        let indices: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..20)
                .map(|_| {
                    s.spawn(|| {
                        repo.get_unused(&scheme, Feature::Deposit, 0, true)
                            .unwrap()
                            .unwrap()
                            .index()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut sorted = indices.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
        assert_eq!(indices.iter().collect::<HashSet<_>>().len(), 20);
    }

    #[test]
    fn test_cancel_reservation() {
        let repo = repository();
        let scheme = scheme(6);
        repo.track(&scheme).unwrap();

        let a = repo.get_unused(&scheme, Feature::Deposit, 0, true).unwrap().unwrap();
        let b = repo.get_unused(&scheme, Feature::Deposit, 0, true).unwrap().unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));

        // Reservations are ignored without reserve
        let peek = repo.get_unused(&scheme, Feature::Deposit, 0, false).unwrap().unwrap();
        assert_eq!(peek.index(), 0);

        repo.cancel_reservation(&scheme, &[a.key_path]);
        let again = repo.get_unused(&scheme, Feature::Deposit, 0, true).unwrap().unwrap();
        assert_eq!(again.index(), 0);
        let c = repo.get_unused(&scheme, Feature::Deposit, 0, true).unwrap().unwrap();
        assert_eq!(c.index(), 2);
    }

    #[test]
    fn test_reservation_lease_expires() {
        let repo = KeyRepository::open(
            Arc::new(MemoryStore::new()),
            Network::Regtest,
            RepositoryConfig {
                reservation_lease: Duration::ZERO,
                ..Default::default()
            },
        );
        let scheme = scheme(7);
        repo.track(&scheme).unwrap();

        let first = repo.get_unused(&scheme, Feature::Deposit, 0, true).unwrap().unwrap();
        let second = repo.get_unused(&scheme, Feature::Deposit, 0, true).unwrap().unwrap();
        assert_eq!(first.index(), second.index());
        assert!(matches!(
            repo.renew_reservation(&scheme, first.key_path),
            Err(RepositoryError::ReservationExpired { .. })
        ));
    }

    #[test]
    fn test_renew_live_reservation() {
        let repo = repository();
        let scheme = scheme(7);
        repo.track(&scheme).unwrap();
        let entry = repo.get_unused(&scheme, Feature::Change, 0, true).unwrap().unwrap();
        repo.renew_reservation(&scheme, entry.key_path).unwrap();
        let next = repo.get_unused(&scheme, Feature::Change, 0, true).unwrap().unwrap();
        assert_eq!(next.index(), 1);
    }

    #[test]
    fn test_used_index_releases_reservation() {
        let repo = repository();
        let scheme = scheme(8);
        repo.track(&scheme).unwrap();
        let entry = repo.get_unused(&scheme, Feature::Deposit, 0, true).unwrap().unwrap();
        repo.mark_as_used(&[entry.clone()]).unwrap();
        assert!(repo.renew_reservation(&scheme, entry.key_path).is_err());
    }

    #[test]
    fn test_untrack_removes_entries() {
        let repo = repository();
        let scheme = scheme(9);
        repo.track(&scheme).unwrap();
        repo.mark_as_used(&[lookup(&repo, &scheme, 20).unwrap()]).unwrap();

        assert!(repo.untrack(&scheme).unwrap());
        assert!(lookup(&repo, &scheme, 0).is_none());
        assert!(lookup(&repo, &scheme, 49).is_none());
        assert!(!repo.is_tracked(&scheme).unwrap());
        assert!(repo.window(&scheme, Feature::Deposit).unwrap().is_none());
        assert!(!repo.untrack(&scheme).unwrap());

        // Late uses of an untracked scheme are ignored
        let stale = KeyPathEntry::from(scheme.derive(Feature::Deposit, 3).unwrap());
        repo.mark_as_used(&[stale]).unwrap();
        assert!(repo.window(&scheme, Feature::Deposit).unwrap().is_none());
    }

    #[test]
    fn test_schemes_are_isolated() {
        let repo = repository();
        let (a, b) = (scheme(10), scheme(11));
        repo.track(&a).unwrap();
        repo.track(&b).unwrap();
        repo.mark_as_used(&[lookup(&repo, &a, 9).unwrap()]).unwrap();

        assert_eq!(
            repo.window(&b, Feature::Deposit).unwrap().unwrap().highest_used,
            None
        );
        let names: Vec<String> = repo
            .tracked_schemes()
            .unwrap()
            .into_iter()
            .map(|r| r.scheme)
            .collect();
        assert!(names.contains(&a.to_string()) && names.contains(&b.to_string()));
    }

    #[test]
    fn test_state_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let scheme = scheme(12);
        {
            let store = Arc::new(FileStore::open(&config).unwrap());
            let repo = KeyRepository::open(store, Network::Regtest, RepositoryConfig::default());
            repo.track(&scheme).unwrap();
            repo.mark_as_used(&[lookup(&repo, &scheme, 2).unwrap()]).unwrap();
        }

        let store = Arc::new(FileStore::open(&config).unwrap());
        let repo = KeyRepository::open(store, Network::Regtest, RepositoryConfig::default());
        let window = repo.window(&scheme, Feature::Deposit).unwrap().unwrap();
        assert_eq!(window.highest_used, Some(2));
        assert_eq!(window.highest_generated, 31);
        assert_eq!(repo.load_tracked_schemes().unwrap(), vec![scheme]);
    }

    #[test]
    fn test_store_failure_leaves_no_partial_state() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            broken: std::sync::atomic::AtomicBool::new(false),
        });
        let repo = KeyRepository::open(store.clone(), Network::Regtest, RepositoryConfig::default());
        let scheme = scheme(13);
        repo.track(&scheme).unwrap();
        let used = lookup(&repo, &scheme, 10).unwrap();

        store.broken.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            repo.mark_as_used(&[used]),
            Err(RepositoryError::Storage(StorageError::Unavailable(_)))
        ));
        let window = repo.window(&scheme, Feature::Deposit).unwrap().unwrap();
        assert_eq!(window.highest_used, None);
        assert!(lookup(&repo, &scheme, 30).is_none());

        let other = self::scheme(14);
        assert!(repo.track(&other).is_err());
        assert!(repo.window(&other, Feature::Deposit).unwrap().is_none());
    }

    #[test]
    fn test_wrong_network_rejected() {
        let repo = repository();
        let main = DerivationScheme::direct(test_keys::xpub(1), ScriptKind::Segwit, Network::Main);
        assert!(matches!(
            repo.track(&main),
            Err(RepositoryError::WrongNetwork(Network::Main, Network::Regtest))
        ));
    }
}
