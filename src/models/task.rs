//! Task records: sync and STRM task definitions plus their live run state.
//!
//! A `Task` is the unit the scheduler owns. Structural fields are persisted
//! to `tasks.json`; live fields (status, stats, progress) are memory-only and
//! reset to idle on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Live scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Error,
}

/// What a single run of a task should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunKind {
    Sync,
    Strm,
    FullOverwrite,
    Reconstruct,
}

/// Suffix filter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuffixMode {
    #[default]
    None,
    Include,
    Exclude,
}

/// Extension-based file filter. The list holds lowercase extensions without
/// the leading dot; the empty string matches extensionless files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SuffixFilter {
    #[serde(default)]
    pub mode: SuffixMode,
    #[serde(default)]
    pub list: Vec<String>,
}

impl SuffixFilter {
    /// Normalize the stored list: lowercase, strip a leading dot.
    pub fn normalize(&mut self) {
        for ext in &mut self.list {
            *ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        }
    }

    /// Whether a file with the given (lowercase, dotless) extension passes.
    pub fn admits(&self, ext: &str) -> bool {
        match self.mode {
            SuffixMode::None => true,
            SuffixMode::Include => self.list.iter().any(|e| e == ext),
            SuffixMode::Exclude => !self.list.iter().any(|e| e == ext),
        }
    }
}

/// Size window filter; open bounds when unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SizeFilter {
    #[serde(default)]
    pub min_bytes: Option<u64>,
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

impl SizeFilter {
    pub fn admits(&self, size: u64) -> bool {
        if let Some(min) = self.min_bytes {
            if size < min {
                return false;
            }
        }
        if let Some(max) = self.max_bytes {
            if size > max {
                return false;
            }
        }
        true
    }
}

/// Base instant for delayed source deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteTimeBase {
    #[default]
    SyncComplete,
    FileCreate,
}

/// Delete-source policy for sync tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeletePolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub delay_days: u32,
    #[serde(default)]
    pub time_base: DeleteTimeBase,
    #[serde(default)]
    pub delete_parent: bool,
    #[serde(default)]
    pub parent_levels: u32,
    #[serde(default)]
    pub force_delete_nonempty: bool,
}

/// Final statistics of a run; also kept on the task as the last snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskStats {
    pub total: u64,
    pub success: u64,
    pub skipped: u64,
    pub skipped_filtered: u64,
    pub failed: u64,
    /// Set when the STRM mass-delete guard suppressed the deletion phase.
    #[serde(default)]
    pub protection_tripped: bool,
}

/// Live progress published while a run is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskProgress {
    pub done: u64,
    pub total: u64,
    pub success: u64,
    pub skipped: u64,
    pub failed: u64,
    pub percent: u8,
}

impl TaskProgress {
    pub fn percent_of(done: u64, total: u64) -> u8 {
        if total == 0 {
            0
        } else {
            ((done.saturating_mul(100)) / total).min(100) as u8
        }
    }
}

/// Directory sync task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub source_path: String,
    pub target_path: String,
    /// Classic 5-field cron expression (m h dom mon dow).
    pub cron: String,
    #[serde(default = "default_thread_count")]
    pub thread_count: u32,
    #[serde(default)]
    pub is_slow_storage: bool,
    #[serde(default)]
    pub rule_not_exists: bool,
    #[serde(default)]
    pub rule_size_diff: bool,
    #[serde(default)]
    pub rule_mtime_newer: bool,
    #[serde(default)]
    pub size_filter: SizeFilter,
    #[serde(default)]
    pub suffix_filter: SuffixFilter,
    #[serde(default)]
    pub delete_policy: DeletePolicy,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,

    // Live fields, never persisted.
    #[serde(skip)]
    pub status: TaskStatus,
    #[serde(skip)]
    pub stats: TaskStats,
    #[serde(skip)]
    pub progress: TaskProgress,
    #[serde(skip)]
    pub next_run: Option<DateTime<Utc>>,
}

fn default_thread_count() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl SyncTask {
    /// Worker pool size for a run: slow storage is capped at two workers.
    pub fn effective_thread_count(&self) -> usize {
        let threads = self.thread_count.max(1) as usize;
        if self.is_slow_storage {
            threads.min(2)
        } else {
            threads
        }
    }

    /// The per-file decision rules, with the documented fallback: when no
    /// rule is enabled the engine behaves as `rule_not_exists` only.
    pub fn effective_rules(&self) -> (bool, bool, bool) {
        if !self.rule_not_exists && !self.rule_size_diff && !self.rule_mtime_newer {
            (true, false, false)
        } else {
            (
                self.rule_not_exists,
                self.rule_size_diff,
                self.rule_mtime_newer,
            )
        }
    }
}

/// STRM content mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StrmMode {
    #[serde(rename = "AlistURL")]
    #[default]
    AlistUrl,
    #[serde(rename = "RawURL")]
    RawUrl,
    #[serde(rename = "AlistPath")]
    AlistPath,
}

/// Anti-mass-delete parameters for STRM tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartProtection {
    pub threshold: usize,
    pub grace_scans: u32,
}

impl Default for SmartProtection {
    fn default() -> Self {
        Self {
            threshold: 100,
            grace_scans: 3,
        }
    }
}

/// STRM generation task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrmTask {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Remote source directory on the OpenList server.
    pub source_dir: String,
    /// Local directory receiving .strm and companion files.
    pub target_dir: String,
    pub cron: String,
    #[serde(default)]
    pub mode: StrmMode,
    #[serde(default)]
    pub subtitle: bool,
    #[serde(default)]
    pub image: bool,
    #[serde(default)]
    pub nfo: bool,
    /// Drop the remote directory structure: every generated file lands
    /// directly in the target root.
    #[serde(default)]
    pub flatten_mode: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    /// Politeness pause between directory listings, in seconds.
    #[serde(default)]
    pub wait_time_secs: u64,
    /// Delete local .strm files whose remote source disappeared.
    #[serde(default)]
    pub sync_server_delete: bool,
    /// Propagate locally deleted .strm files as remote deletions.
    #[serde(default)]
    pub sync_local_delete: bool,
    #[serde(default)]
    pub suffix_filter: SuffixFilter,
    #[serde(default)]
    pub protection: SmartProtection,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub status: TaskStatus,
    #[serde(skip)]
    pub stats: TaskStats,
    #[serde(skip)]
    pub progress: TaskProgress,
    #[serde(skip)]
    pub next_run: Option<DateTime<Utc>>,
}

fn default_max_workers() -> u32 {
    4
}

impl StrmTask {
    /// Worker pool size, soft-capped at 10.
    pub fn effective_workers(&self) -> usize {
        (self.max_workers.max(1) as usize).min(10)
    }
}

/// A scheduled task of either kind, distinguished by the `type` tag in
/// `tasks.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Task {
    #[serde(rename = "sync")]
    Sync(SyncTask),
    #[serde(rename = "strm")]
    Strm(StrmTask),
}

impl Task {
    pub fn id(&self) -> &str {
        match self {
            Task::Sync(t) => &t.id,
            Task::Strm(t) => &t.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Task::Sync(t) => &t.name,
            Task::Strm(t) => &t.name,
        }
    }

    pub fn cron(&self) -> &str {
        match self {
            Task::Sync(t) => &t.cron,
            Task::Strm(t) => &t.cron,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Task::Sync(t) => t.enabled,
            Task::Strm(t) => t.enabled,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        match self {
            Task::Sync(t) => t.enabled = enabled,
            Task::Strm(t) => t.enabled = enabled,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            Task::Sync(t) => t.status,
            Task::Strm(t) => t.status,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        match self {
            Task::Sync(t) => t.status = status,
            Task::Strm(t) => t.status = status,
        }
    }

    pub fn set_stats(&mut self, stats: TaskStats) {
        match self {
            Task::Sync(t) => t.stats = stats,
            Task::Strm(t) => t.stats = stats,
        }
    }

    pub fn set_progress(&mut self, progress: TaskProgress) {
        match self {
            Task::Sync(t) => t.progress = progress,
            Task::Strm(t) => t.progress = progress,
        }
    }

    pub fn set_last_run(&mut self, at: DateTime<Utc>) {
        match self {
            Task::Sync(t) => t.last_run = Some(at),
            Task::Strm(t) => t.last_run = Some(at),
        }
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        match self {
            Task::Sync(t) => t.next_run,
            Task::Strm(t) => t.next_run,
        }
    }

    pub fn set_next_run(&mut self, at: Option<DateTime<Utc>>) {
        match self {
            Task::Sync(t) => t.next_run = at,
            Task::Strm(t) => t.next_run = at,
        }
    }

    /// The run kind a scheduler fire produces for this task.
    pub fn fire_kind(&self) -> RunKind {
        match self {
            Task::Sync(_) => RunKind::Sync,
            Task::Strm(_) => RunKind::Strm,
        }
    }

    /// Assign a fresh id when none was provided, normalize filters, and
    /// reset live state. Called on create and on load.
    pub fn normalize(&mut self) {
        match self {
            Task::Sync(t) => {
                if t.id.is_empty() {
                    t.id = Uuid::new_v4().to_string();
                }
                t.suffix_filter.normalize();
                t.status = TaskStatus::Idle;
            }
            Task::Strm(t) => {
                if t.id.is_empty() {
                    t.id = Uuid::new_v4().to_string();
                }
                t.suffix_filter.normalize();
                t.status = TaskStatus::Idle;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_task() -> SyncTask {
        SyncTask {
            id: "t1".into(),
            name: "T1".into(),
            source_path: "/src".into(),
            target_path: "/dst".into(),
            cron: "*/5 * * * *".into(),
            thread_count: 4,
            is_slow_storage: false,
            rule_not_exists: false,
            rule_size_diff: false,
            rule_mtime_newer: false,
            size_filter: SizeFilter::default(),
            suffix_filter: SuffixFilter::default(),
            delete_policy: DeletePolicy::default(),
            enabled: true,
            last_run: None,
            status: TaskStatus::Idle,
            stats: TaskStats::default(),
            progress: TaskProgress::default(),
            next_run: None,
        }
    }

    #[test]
    fn test_slow_storage_caps_threads() {
        let mut task = sync_task();
        assert_eq!(task.effective_thread_count(), 4);
        task.is_slow_storage = true;
        assert_eq!(task.effective_thread_count(), 2);
        task.thread_count = 0;
        assert_eq!(task.effective_thread_count(), 1);
    }

    #[test]
    fn test_no_rules_falls_back_to_not_exists() {
        let task = sync_task();
        assert_eq!(task.effective_rules(), (true, false, false));
    }

    #[test]
    fn test_enabled_rules_pass_through() {
        let mut task = sync_task();
        task.rule_size_diff = true;
        assert_eq!(task.effective_rules(), (false, true, false));
    }

    #[test]
    fn test_suffix_filter_normalization() {
        let mut filter = SuffixFilter {
            mode: SuffixMode::Exclude,
            list: vec![".MP4".into(), "Mkv".into(), " .NFO".into()],
        };
        filter.normalize();
        assert_eq!(filter.list, vec!["mp4", "mkv", "nfo"]);
        assert!(!filter.admits("mp4"));
        assert!(filter.admits("srt"));
    }

    #[test]
    fn test_suffix_filter_extensionless() {
        let include_empty = SuffixFilter {
            mode: SuffixMode::Include,
            list: vec!["".into()],
        };
        assert!(include_empty.admits(""));

        let include_mp4 = SuffixFilter {
            mode: SuffixMode::Include,
            list: vec!["mp4".into()],
        };
        assert!(!include_mp4.admits(""));

        let exclude_mp4 = SuffixFilter {
            mode: SuffixMode::Exclude,
            list: vec!["mp4".into()],
        };
        assert!(exclude_mp4.admits(""));
    }

    #[test]
    fn test_size_filter_bounds_inclusive() {
        let filter = SizeFilter {
            min_bytes: Some(10),
            max_bytes: Some(100),
        };
        assert!(!filter.admits(9));
        assert!(filter.admits(10));
        assert!(filter.admits(100));
        assert!(!filter.admits(101));
        assert!(SizeFilter::default().admits(u64::MAX));
    }

    #[test]
    fn test_task_round_trip_preserves_fields() {
        let task = Task::Sync(sync_task());
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains(r#""type":"sync""#));
        let back: Task = serde_json::from_str(&json).unwrap();
        match (task, back) {
            (Task::Sync(a), Task::Sync(b)) => {
                assert_eq!(a.id, b.id);
                assert_eq!(a.cron, b.cron);
                assert_eq!(a.thread_count, b.thread_count);
                assert_eq!(a.delete_policy, b.delete_policy);
            }
            _ => panic!("kind changed in round trip"),
        }
    }

    #[test]
    fn test_live_fields_not_serialized() {
        let mut task = sync_task();
        task.status = TaskStatus::Running;
        task.stats.success = 9;
        let json = serde_json::to_string(&Task::Sync(task)).unwrap();
        assert!(!json.contains("RUNNING"));
        assert!(!json.contains("progress"));
    }

    #[test]
    fn test_normalize_assigns_id() {
        let mut task = Task::Sync(SyncTask {
            id: String::new(),
            ..sync_task()
        });
        task.normalize();
        assert!(!task.id().is_empty());
    }

    #[test]
    fn test_strm_task_defaults() {
        let json = r#"{
            "type": "strm",
            "name": "s",
            "source_dir": "/media",
            "target_dir": "/strm",
            "cron": "0 3 * * *"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        let Task::Strm(t) = task else { panic!("wrong kind") };
        assert!(!t.flatten_mode);
        assert_eq!(t.mode, StrmMode::AlistUrl);
        assert_eq!(t.protection.threshold, 100);
        assert_eq!(t.protection.grace_scans, 3);
    }

    #[test]
    fn test_strm_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&StrmMode::AlistUrl).unwrap(),
            r#""AlistURL""#
        );
        assert_eq!(
            serde_json::to_string(&StrmMode::AlistPath).unwrap(),
            r#""AlistPath""#
        );
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(TaskProgress::percent_of(0, 0), 0);
        assert_eq!(TaskProgress::percent_of(1, 2), 50);
        assert_eq!(TaskProgress::percent_of(2, 2), 100);
    }
}
