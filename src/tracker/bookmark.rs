//! Stream cursors

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Opaque position in a change stream
///
/// A bookmark is valid only for the stream epoch it was issued from.
/// Rendered as 32 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Bookmark {
    epoch: u64,
    position: u64,
}

impl Bookmark {
    /// No history known
    pub const START: Bookmark = Bookmark {
        epoch: 0,
        position: 0,
    };

    pub(crate) fn new(epoch: u64, position: u64) -> Self {
        Self { epoch, position }
    }

    pub fn is_start(&self) -> bool {
        *self == Self::START
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.epoch, self.position)
    }
}

impl FromStr for Bookmark {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(format!("invalid bookmark: {}", s));
        }
        let epoch = u64::from_str_radix(&s[..16], 16).map_err(|e| e.to_string())?;
        let position = u64::from_str_radix(&s[16..], 16).map_err(|e| e.to_string())?;
        Ok(Self { epoch, position })
    }
}

impl Serialize for Bookmark {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Bookmark {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bookmark_text_form() {
        let bookmark = Bookmark::new(0xdead_beef, 12);
        let text = bookmark.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<Bookmark>().unwrap(), bookmark);
        assert_eq!(
            Bookmark::START.to_string(),
            "00000000000000000000000000000000"
        );
        assert!("xyz".parse::<Bookmark>().is_err());
    }

    #[test]
    fn test_bookmarks_are_ordered() {
        assert!(Bookmark::new(1, 5) < Bookmark::new(1, 6));
        assert!(Bookmark::START < Bookmark::new(1, 0));
        assert!(Bookmark::default().is_start());
    }
}
