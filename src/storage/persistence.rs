//! Persistence layer
//!
//! The tracking core only needs an ordered key-value store with point
//! reads, prefix scans and atomic batch writes. [`MemoryStore`] keeps
//! everything in a `BTreeMap`; [`FileStore`] mirrors the same map into a
//! JSON snapshot that is replaced atomically on every batch.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

// =============================================================================
// Write Batch
// =============================================================================

#[derive(Debug, Clone)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of mutations applied all-or-nothing
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    /// Serialize `value` as JSON and queue it under `key`
    pub fn put_json<T: Serialize>(
        &mut self,
        key: impl Into<Vec<u8>>,
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, bytes);
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply to a map, returning the previous values for rollback
    fn apply(self, map: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let mut undo = Vec::with_capacity(self.ops.len());
        for op in self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    let previous = map.insert(key.clone(), value);
                    undo.push((key, previous));
                }
                BatchOp::Delete(key) => {
                    let previous = map.remove(&key);
                    undo.push((key, previous));
                }
            }
        }
        undo
    }
}

fn rollback(map: &mut BTreeMap<Vec<u8>, Vec<u8>>, undo: Vec<(Vec<u8>, Option<Vec<u8>>)>) {
    for (key, previous) in undo.into_iter().rev() {
        match previous {
            Some(value) => map.insert(key, value),
            None => map.remove(&key),
        };
    }
}

fn scan(map: &BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    map.range(prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

// =============================================================================
// Store Contract
// =============================================================================

/// Durable ordered key-value store
pub trait KvStore: Send + Sync {
    /// Point lookup
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Apply a batch atomically: either every mutation is visible or none is
    fn write(&self, batch: WriteBatch) -> Result<(), StorageError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }
}

/// Read and decode a JSON value
pub fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &[u8],
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Scan a prefix and decode every value as JSON
pub fn scan_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    prefix: &[u8],
) -> Result<Vec<(Vec<u8>, T)>, StorageError> {
    store
        .scan_prefix(prefix)?
        .into_iter()
        .map(|(key, value)| Ok((key, serde_json::from_slice(&value)?)))
        .collect()
}

// =============================================================================
// Memory Store
// =============================================================================

/// Volatile store, used for tests and ephemeral deployments
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        Ok(scan(&map, prefix))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        batch.apply(&mut map);
        Ok(())
    }
}

// =============================================================================
// File Store
// =============================================================================

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub store_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".tracker_data"),
            store_file: "store.json".to_string(),
        }
    }
}

/// Store persisted as a JSON snapshot (hex keys and values)
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    temp_path: PathBuf,
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl FileStore {
    /// Open (or create) the store described by `config`
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        let path = config.data_dir.join(&config.store_file);
        let temp_path = config.data_dir.join(format!("{}.tmp", config.store_file));
        let map = if path.exists() {
            load_snapshot(&path)?
        } else {
            BTreeMap::new()
        };
        log::debug!("Opened store {} with {} entries", path.display(), map.len());
        Ok(Self {
            path,
            temp_path,
            map: RwLock::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), StorageError> {
        let snapshot: BTreeMap<String, String> = map
            .iter()
            .map(|(k, v)| (hex::encode(k), hex::encode(v)))
            .collect();

        // Write to temporary file first
        let file = fs::File::create(&self.temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &snapshot)?;
        writer.flush()?;

        // Atomic rename
        fs::rename(&self.temp_path, &self.path)?;
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StorageError> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let snapshot: BTreeMap<String, String> = serde_json::from_reader(reader)?;
    snapshot
        .into_iter()
        .map(|(k, v)| {
            let key = hex::decode(&k).map_err(|e| StorageError::InvalidData(e.to_string()))?;
            let value = hex::decode(&v).map_err(|e| StorageError::InvalidData(e.to_string()))?;
            Ok((key, value))
        })
        .collect()
}

impl KvStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        Ok(scan(&map, prefix))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        let undo = batch.apply(&mut map);
        if let Err(e) = self.persist(&map) {
            rollback(&mut map, undo);
            log::error!("Failed to persist store {}: {}", self.path.display(), e);
            return Err(StorageError::Unavailable(e.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_scan_prefix() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a/1".to_vec(), b"one".to_vec());
        batch.put(b"a/2".to_vec(), b"two".to_vec());
        batch.put(b"b/1".to_vec(), b"other".to_vec());
        store.write(batch).unwrap();

        let entries = store.scan_prefix(b"a/").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, b"one".to_vec());
        assert_eq!(entries[1].1, b"two".to_vec());
        assert!(store.scan_prefix(b"c/").unwrap().is_empty());
    }

    #[test]
    fn test_batch_delete() {
        let store = MemoryStore::new();
        store.put(b"k", b"v").unwrap();
        let mut batch = WriteBatch::new();
        batch.delete(b"k".to_vec());
        store.write(batch).unwrap();
        assert!(store.get(b"k").unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_json_helpers() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put_json(b"n/1".to_vec(), &vec![1u32, 2, 3]).unwrap();
        store.write(batch).unwrap();

        let value: Option<Vec<u32>> = get_json(&store, b"n/1").unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
        let all: Vec<(Vec<u8>, Vec<u32>)> = scan_json(&store, b"n/").unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_file_store_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };

        {
            let store = FileStore::open(&config).unwrap();
            store.put(b"key", b"value").unwrap();
            assert!(store.path().exists());
        }

        let reopened = FileStore::open(&config).unwrap();
        assert_eq!(reopened.get(b"key").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn test_file_store_failed_write_is_not_visible() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let store = FileStore::open(&config).unwrap();
        store.put(b"kept", b"1").unwrap();

        // Removing the directory makes the snapshot write fail
        fs::remove_dir_all(temp_dir.path()).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"lost".to_vec(), b"2".to_vec());
        batch.delete(b"kept".to_vec());
        let err = store.write(batch).unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));

        assert_eq!(store.get(b"kept").unwrap(), Some(b"1".to_vec()));
        assert!(store.get(b"lost").unwrap().is_none());
    }
}
