use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// Peer paths are Windows-style; the file name is whatever follows the last backslash.
static TRAILING_SEGMENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[^\\]+$").ok());

/// One remote file selected for download.
///
/// Items are read-only once selected. Retry bookkeeping lives in the
/// classifier's ledger, keyed by [`ItemId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    /// Peer sharing the file.
    pub user: String,
    /// Remote path as reported by the peer (backslash separated).
    pub file: String,
    pub size: u64,
    /// Declared bitrate in kbps, when the peer advertises one.
    #[serde(default)]
    pub bitrate: Option<u32>,
    /// Peer upload speed in bytes per second.
    #[serde(default)]
    pub speed: u64,
    /// Whether the peer currently has a free upload slot.
    #[serde(default)]
    pub slots: bool,
}

/// Stable identity of a transfer item across retry rounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ItemId {
    pub user: String,
    pub file: String,
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.file)
    }
}

impl TransferItem {
    pub fn new(user: impl Into<String>, file: impl Into<String>, size: u64) -> Self {
        Self { user: user.into(), file: file.into(), size, bitrate: None, speed: 0, slots: true }
    }

    pub fn id(&self) -> ItemId {
        ItemId { user: self.user.clone(), file: self.file.clone() }
    }

    /// File name used on local storage: the last backslash-separated segment.
    pub fn display_name(&self) -> String {
        display_name(&self.file)
    }

    /// Extension of the display name, lowercased, without the dot.
    pub fn extension(&self) -> Option<String> {
        let name = self.display_name();
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// Rough transfer time in seconds; unknown speed sorts last.
    pub fn estimated_secs(&self) -> f64 {
        if self.speed == 0 { f64::INFINITY } else { self.size as f64 / self.speed as f64 }
    }
}

pub fn display_name(remote: &str) -> String {
    TRAILING_SEGMENT
        .as_ref()
        .and_then(|re| re.find(remote))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| remote.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_takes_last_backslash_segment() {
        assert_eq!(display_name("@@music\\Gesaffelstein\\Atmosphere.mp3"), "Atmosphere.mp3");
        assert_eq!(display_name("plain.mp3"), "plain.mp3");
    }

    #[test]
    fn display_name_trailing_backslash_falls_back_to_full_path() {
        assert_eq!(display_name("dir\\"), "dir\\");
    }

    #[test]
    fn extension_is_lowercased() {
        let item = TransferItem::new("u", "a\\b\\Track.MP3", 10);
        assert_eq!(item.extension().as_deref(), Some("mp3"));
        let none = TransferItem::new("u", "a\\b\\.hidden", 10);
        assert_eq!(none.extension(), None);
    }

    #[test]
    fn identity_ignores_metadata() {
        let mut a = TransferItem::new("u", "x\\y.mp3", 10);
        let b = TransferItem::new("u", "x\\y.mp3", 99);
        a.speed = 5;
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().to_string(), "u@x\\y.mp3");
    }
}
