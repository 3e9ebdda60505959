//! Shared request/response shapes for the control surface.
//!
//! Success responses carry `{"success": true, ...}`; errors carry
//! `{"error": "..."}` (see `AppError::into_response`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Task, TaskProgress, TaskStats, TaskStatus};

/// A task record with its live fields, as served to the dashboard.
#[derive(Debug, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub status: TaskStatus,
    pub stats: TaskStats,
    pub progress: TaskProgress,
    pub next_run: Option<DateTime<Utc>>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        let (status, stats, progress, next_run) = match &task {
            Task::Sync(t) => (t.status, t.stats, t.progress, t.next_run),
            Task::Strm(t) => (t.status, t.stats, t.progress, t.next_run),
        };
        Self {
            task,
            status,
            stats,
            progress,
            next_run,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct CronValidateRequest {
    pub expression: String,
}

#[derive(Debug, Deserialize)]
pub struct CronRandomRequest {
    pub pattern: String,
}

#[derive(Debug, Deserialize)]
pub struct BrowseQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct BrowseEntry {
    pub name: String,
    pub is_dir: bool,
}

/// OpenList settings as edited through the API; the password travels in the
/// clear over this private control surface and is blanked on reads.
#[derive(Debug, Deserialize)]
pub struct OpenListSettingsRequest {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub public_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ExtensionsRequest {
    #[serde(default)]
    pub video: Option<String>,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub nfo: String,
    #[serde(default)]
    pub other: String,
}

#[derive(Debug, Deserialize)]
pub struct SystemSettingsRequest {
    pub sync_retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SuffixFilter, SyncTask};

    #[test]
    fn test_task_view_carries_live_fields() {
        let mut task = SyncTask {
            id: "a".into(),
            name: "a".into(),
            source_path: "/s".into(),
            target_path: "/t".into(),
            cron: "*/5 * * * *".into(),
            thread_count: 1,
            is_slow_storage: false,
            rule_not_exists: true,
            rule_size_diff: false,
            rule_mtime_newer: false,
            size_filter: Default::default(),
            suffix_filter: SuffixFilter::default(),
            delete_policy: Default::default(),
            enabled: true,
            last_run: None,
            status: TaskStatus::Running,
            stats: TaskStats {
                total: 3,
                success: 2,
                skipped: 1,
                skipped_filtered: 0,
                failed: 0,
                protection_tripped: false,
            },
            progress: Default::default(),
            next_run: None,
        };
        task.progress.percent = 66;

        let view = TaskView::from(Task::Sync(task));
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["type"], "sync");
        assert_eq!(json["status"], "RUNNING");
        assert_eq!(json["stats"]["success"], 2);
        assert_eq!(json["progress"]["percent"], 66);
    }
}
