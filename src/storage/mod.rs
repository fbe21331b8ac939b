//! Storage module for tracker persistence

pub mod persistence;

pub use persistence::{
    get_json, scan_json, FileStore, KvStore, MemoryStore, StorageConfig, StorageError, WriteBatch,
};
