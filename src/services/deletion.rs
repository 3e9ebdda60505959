//! Deletion planner for delayed source removal.
//!
//! Given a task's delete policy and a sync-cache entry, decides whether the
//! source file is due for removal now and how many parent directory levels
//! the worker may ascend afterwards. Only entries that have successfully
//! reached the target (status SYNCED) are ever eligible.

use chrono::{DateTime, Duration, Utc};

use crate::models::{DeletePolicy, DeleteTimeBase, SyncCacheEntry, SyncEntryStatus};

/// Outcome of a planning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionDecision {
    pub delete: bool,
    /// Parent levels the caller may ascend when removing empty directories;
    /// zero when parent deletion is disabled or the file stays.
    pub ascend_levels: u32,
}

impl DeletionDecision {
    const KEEP: Self = Self {
        delete: false,
        ascend_levels: 0,
    };
}

/// Decide whether a cache entry's source file should be removed now.
pub fn plan(policy: &DeletePolicy, entry: &SyncCacheEntry, now: DateTime<Utc>) -> DeletionDecision {
    if !policy.enabled || entry.status != SyncEntryStatus::Synced {
        return DeletionDecision::KEEP;
    }

    let due = if policy.delay_days == 0 {
        // Eligible on the first normal-run pass after the entry became SYNCED.
        true
    } else {
        let base = match policy.time_base {
            DeleteTimeBase::SyncComplete => entry.last_sync,
            DeleteTimeBase::FileCreate => entry.file_create.or(entry.last_sync),
        };
        match base {
            Some(base) => now - base >= Duration::days(i64::from(policy.delay_days)),
            None => false,
        }
    };

    if !due {
        return DeletionDecision::KEEP;
    }

    DeletionDecision {
        delete: true,
        ascend_levels: if policy.delete_parent {
            policy.parent_levels
        } else {
            0
        },
    }
}
