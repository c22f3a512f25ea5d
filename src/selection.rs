use std::path::Path;
use std::time::Duration;

use crate::SessionError;
use crate::transfer::{PeerSession, TransferItem};

pub const DEFAULT_SEARCH_DURATION: Duration = Duration::from_millis(2000);

/// Produces the final, approved list of items before any download starts.
pub trait SelectionProvider {
    fn collect_track_list(&self, session: &dyn PeerSession) -> Result<Vec<TransferItem>, SessionError>;
}

/// Which search results are acceptable downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFilter {
    /// Lowercase extension without the dot.
    pub extension: String,
    /// Required bitrate; `None` accepts anything.
    pub bitrate: Option<u32>,
    pub require_slots: bool,
}

impl Default for CandidateFilter {
    fn default() -> Self {
        Self { extension: "mp3".to_string(), bitrate: Some(320), require_slots: true }
    }
}

impl CandidateFilter {
    pub fn accepts(&self, item: &TransferItem) -> bool {
        if item.extension().as_deref() != Some(self.extension.as_str()) {
            return false;
        }
        if let Some(want) = self.bitrate
            && item.bitrate != Some(want)
        {
            return false;
        }
        !self.require_slots || item.slots
    }
}

/// Filter search results and order them by estimated transfer time, fastest first.
pub fn rank_candidates(results: Vec<TransferItem>, filter: &CandidateFilter) -> Vec<TransferItem> {
    let mut kept: Vec<TransferItem> = results.into_iter().filter(|it| filter.accepts(it)).collect();
    kept.sort_by(|a, b| a.estimated_secs().total_cmp(&b.estimated_secs()));
    kept
}

/// One-line description shown when listing candidates.
pub fn candidate_label(item: &TransferItem) -> String {
    let bitrate = item.bitrate.map(|b| format!("{}kbps", b)).unwrap_or_else(|| "?kbps".to_string());
    format!(
        "{} ({}) - {} - {} - {}",
        item.display_name(),
        crate::util::human_bytes(item.size),
        item.file,
        bitrate,
        item.speed
    )
}

/// A list decided ahead of time.
#[derive(Debug, Clone, Default)]
pub struct FixedSelection {
    items: Vec<TransferItem>,
}

impl FixedSelection {
    pub fn new(items: Vec<TransferItem>) -> Self {
        Self { items }
    }

    /// Load a JSON array of items.
    pub fn from_json_file(path: &Path) -> Result<Self, SessionError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Selection(format!("{}: {}", path.display(), e)))?;
        let items: Vec<TransferItem> = serde_json::from_str(&raw)
            .map_err(|e| SessionError::Selection(format!("{}: {}", path.display(), e)))?;
        Ok(Self { items })
    }
}

impl SelectionProvider for FixedSelection {
    fn collect_track_list(&self, _session: &dyn PeerSession) -> Result<Vec<TransferItem>, SessionError> {
        Ok(self.items.clone())
    }
}

/// Scripted stand-in for the interactive search loop: every query is searched
/// for `search_duration` and the best ranked candidate is taken.
#[derive(Debug, Clone)]
pub struct QuerySelection {
    queries: Vec<String>,
    search_duration: Duration,
    filter: CandidateFilter,
}

impl QuerySelection {
    pub fn new(queries: Vec<String>, search_duration: Duration) -> Self {
        Self { queries, search_duration, filter: CandidateFilter::default() }
    }

    pub fn with_filter(mut self, filter: CandidateFilter) -> Self {
        self.filter = filter;
        self
    }

    /// One query per line; blank lines and `#` comments are skipped.
    pub fn parse_queries(text: &str) -> Vec<String> {
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    pub fn from_file(path: &Path, search_duration: Duration) -> Result<Self, SessionError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Selection(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(Self::parse_queries(&raw), search_duration))
    }

    pub fn queries(&self) -> &[String] {
        &self.queries
    }
}

impl SelectionProvider for QuerySelection {
    fn collect_track_list(&self, session: &dyn PeerSession) -> Result<Vec<TransferItem>, SessionError> {
        let mut picked = Vec::with_capacity(self.queries.len());
        for query in &self.queries {
            let results = session
                .search(query, self.search_duration)
                .map_err(|e| SessionError::Selection(format!("search '{}' failed: {}", query, e)))?;
            let total = results.len();
            match rank_candidates(results, &self.filter).into_iter().next() {
                Some(best) => {
                    tracing::debug!("[select] '{}' -> {}", query, candidate_label(&best));
                    picked.push(best);
                }
                None => tracing::warn!("[select] no acceptable result for '{}' ({} raw hits)", query, total),
            }
        }
        Ok(picked)
    }
}
