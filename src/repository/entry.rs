//! Persisted repository rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::core::{Network, Script};
use crate::derivation::{DerivedOutput, Feature};

/// Position of a script inside its scheme, rendered `"<feature>/<index>"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath {
    pub feature: Feature,
    pub index: u32,
}

impl KeyPath {
    pub fn new(feature: Feature, index: u32) -> Self {
        Self { feature, index }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feature.index(), self.index)
    }
}

impl FromStr for KeyPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (feature, index) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid key path: {}", s))?;
        let feature = feature
            .parse::<u32>()
            .ok()
            .and_then(Feature::from_index)
            .ok_or_else(|| format!("invalid feature in key path: {}", s))?;
        let index = index
            .parse::<u32>()
            .map_err(|_| format!("invalid index in key path: {}", s))?;
        Ok(Self { feature, index })
    }
}

impl Serialize for KeyPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KeyPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Index row: script → derivation metadata
///
/// Immutable once written; removed only when its scheme is untracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPathEntry {
    pub script_pubkey: Script,
    /// Canonical string of the owning scheme
    pub scheme: String,
    pub key_path: KeyPath,
    pub redeem: Option<Script>,
}

impl KeyPathEntry {
    pub fn feature(&self) -> Feature {
        self.key_path.feature
    }

    pub fn index(&self) -> u32 {
        self.key_path.index
    }

    pub fn address(&self, network: Network) -> Option<String> {
        self.script_pubkey.address(network)
    }
}

impl From<DerivedOutput> for KeyPathEntry {
    fn from(output: DerivedOutput) -> Self {
        Self {
            script_pubkey: output.script_pubkey,
            scheme: output.scheme,
            key_path: KeyPath::new(output.feature, output.index),
            redeem: output.redeem,
        }
    }
}

/// Lookahead state of one (scheme, feature) sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapWindow {
    /// Largest index materialized into the index
    pub highest_generated: u32,
    /// Largest index observed in use
    pub highest_used: Option<u32>,
}

impl GapWindow {
    /// Exclusive end of the window a gap limit requires
    pub fn required_end(&self, gap_limit: u32) -> u32 {
        required_end(self.highest_used, gap_limit)
    }

    /// First index after the highest used one
    pub fn first_unused(&self) -> u32 {
        self.highest_used.map_or(0, |used| used + 1)
    }

    /// Exclusive end of the materialized range
    pub fn generated_end(&self) -> u32 {
        self.highest_generated + 1
    }
}

pub(crate) fn required_end(highest_used: Option<u32>, gap_limit: u32) -> u32 {
    highest_used
        .unwrap_or(0)
        .saturating_add(gap_limit.max(1))
        .min(crate::crypto::HARDENED_KEY_START_INDEX)
}

/// Registry row for a tracked scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedScheme {
    pub scheme: String,
    pub tracked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_path_format() {
        let path = KeyPath::new(Feature::Change, 42);
        assert_eq!(path.to_string(), "1/42");
        assert_eq!("1/42".parse::<KeyPath>().unwrap(), path);
        assert!("2/1".parse::<KeyPath>().is_err());
        assert!("0/x".parse::<KeyPath>().is_err());
        assert!("0".parse::<KeyPath>().is_err());

        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"1/42\"");
    }

    #[test]
    fn test_window_bounds() {
        let fresh = GapWindow {
            highest_generated: 29,
            highest_used: None,
        };
        assert_eq!(fresh.required_end(30), 30);
        assert_eq!(fresh.first_unused(), 0);
        assert_eq!(fresh.generated_end(), 30);

        let used = GapWindow {
            highest_generated: 29,
            highest_used: Some(5),
        };
        assert_eq!(used.required_end(30), 35);
        assert_eq!(used.first_unused(), 6);
    }
}
