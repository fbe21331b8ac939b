//! Deployment configuration
//!
//! Loaded from an optional JSON file; every field falls back to its
//! default when absent.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::explorer::IndexerError;
use crate::core::Network;
use crate::repository::RepositoryConfig;
use crate::storage::StorageConfig;
use crate::tracker::TrackerConfig;

/// Explorer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    pub network: Network,
    /// Directory holding the store file
    pub data_dir: PathBuf,
    pub gap_limit: u32,
    pub reservation_lease_secs: u64,
    pub long_poll_timeout_secs: u64,
    pub notification_capacity: usize,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        let repository = RepositoryConfig::default();
        let tracker = TrackerConfig::default();
        Self {
            network: Network::default(),
            data_dir: StorageConfig::default().data_dir,
            gap_limit: repository.gap_limit,
            reservation_lease_secs: repository.reservation_lease.as_secs(),
            long_poll_timeout_secs: tracker.long_poll_timeout.as_secs(),
            notification_capacity: tracker.notification_capacity,
        }
    }
}

impl ExplorerConfig {
    /// Read a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, IndexerError> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        if config.gap_limit == 0 {
            return Err(IndexerError::Config("gap_limit must be at least 1".into()));
        }
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn repository(&self) -> RepositoryConfig {
        RepositoryConfig {
            gap_limit: self.gap_limit,
            reservation_lease: Duration::from_secs(self.reservation_lease_secs),
        }
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            long_poll_timeout: Duration::from_secs(self.long_poll_timeout_secs),
            notification_capacity: self.notification_capacity,
        }
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            data_dir: self.data_dir.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ExplorerConfig::default();
        assert_eq!(config.gap_limit, 30);
        assert_eq!(config.tracker().long_poll_timeout, Duration::from_secs(10));
        assert_eq!(config.repository().reservation_lease, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "network": "regtest", "gap_limit": 5 }"#).unwrap();

        let config = ExplorerConfig::load(&path).unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.gap_limit, 5);
        assert_eq!(config.long_poll_timeout_secs, 10);
    }

    #[test]
    fn test_zero_gap_limit_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "gap_limit": 0 }"#).unwrap();
        assert!(matches!(
            ExplorerConfig::load(&path),
            Err(IndexerError::Config(_))
        ));
    }
}
