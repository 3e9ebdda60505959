//! Per-task persistent cache trees.
//!
//! Sync tasks keep a map of source-relative path to the outcome of the most
//! recent visit; STRM tasks keep a leaf map with per-leaf absence counters
//! backing the anti-mass-delete safeguard. Both are written as whole
//! documents to `cache/<task-id>.json` after each successful run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome recorded for a sync-tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncEntryStatus {
    Synced,
    Skipped,
    Failed,
    Deleted,
    Pending,
}

/// One sync-tree entry, keyed by source-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCacheEntry {
    pub size: u64,
    /// Source mtime as unix seconds.
    pub mtime: i64,
    pub status: SyncEntryStatus,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    /// Filesystem birth time when available, otherwise the mtime observed
    /// when the entry was first written.
    #[serde(default)]
    pub file_create: Option<DateTime<Utc>>,
}

/// Sync-tree cache document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncTree {
    #[serde(default)]
    pub entries: BTreeMap<String, SyncCacheEntry>,
}

impl SyncTree {
    /// Paths currently marked SYNCED, the only entries eligible for source
    /// deletion.
    pub fn synced_paths(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.status == SyncEntryStatus::Synced)
            .map(|(p, _)| p.clone())
            .collect()
    }
}

/// One STRM cache leaf, keyed by the local `.strm` path relative to the
/// task's target directory. Children are keyed by relative path so the tree
/// carries no cyclic parent references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrmLeaf {
    /// Full remote path of the source video; empty for leaves rebuilt from a
    /// local scan, which cannot recover the remote extension.
    #[serde(default)]
    pub remote_path: String,
    /// Companion files (subtitles, images, nfo) written next to the .strm,
    /// relative to the target directory.
    #[serde(default)]
    pub extra_files: Vec<String>,
    /// Scan counter value when this leaf was last observed remotely.
    #[serde(default)]
    pub last_seen_scan: u64,
    /// Consecutive scans this leaf has been absent from the remote listing.
    #[serde(default)]
    pub miss_count: u32,
}

/// STRM-tree cache document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrmTree {
    /// Remote directory the tree is rooted at.
    #[serde(default)]
    pub root: String,
    /// Monotonic scan counter.
    #[serde(default)]
    pub scan_count: u64,
    #[serde(default)]
    pub leaves: BTreeMap<String, StrmLeaf>,
}
