//! Persistent task store.
//!
//! All task records live in one `tasks.json` document, loaded at startup and
//! rewritten (write-temp-then-rename) on every structural mutation. Live
//! fields are memory-only: a freshly loaded task is always IDLE. Mutations
//! are serialized behind a single writer lock; readers take snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::error::{AppError, Result};
use crate::models::Task;

/// On-disk shape of `tasks.json`.
#[derive(Debug, Serialize, Deserialize, Default)]
struct TaskDocument {
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    last_saved: Option<DateTime<Utc>>,
}

/// Whole-document task store.
pub struct TaskStore {
    path: PathBuf,
    tasks: RwLock<Vec<Task>>,
}

impl TaskStore {
    /// Load the store from disk; a missing file yields an empty store.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let tasks = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut doc: TaskDocument = serde_json::from_slice(&bytes)?;
                for task in &mut doc.tasks {
                    task.normalize();
                }
                tracing::info!(count = doc.tasks.len(), "Loaded task list");
                doc.tasks
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No task list found, starting empty");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            tasks: RwLock::new(tasks),
        })
    }

    /// Snapshot of every task.
    pub async fn list(&self) -> Vec<Task> {
        self.tasks.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.iter().find(|t| t.id() == id).cloned()
    }

    /// Insert or fully replace a task record, then persist.
    pub async fn upsert(&self, mut task: Task) -> Result<Task> {
        validate(&task)?;
        task.normalize();

        let mut tasks = self.tasks.write().await;
        match tasks.iter_mut().find(|t| t.id() == task.id()) {
            Some(existing) => *existing = task.clone(),
            None => tasks.push(task.clone()),
        }
        self.persist(&tasks).await?;
        Ok(task)
    }

    /// Delete a task by id, persisting the new document. Returns whether a
    /// record was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|t| t.id() != id);
        let removed = tasks.len() != before;
        if removed {
            self.persist(&tasks).await?;
        }
        Ok(removed)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
        task.set_enabled(enabled);
        let snapshot = task.clone();
        self.persist(&tasks).await?;
        Ok(snapshot)
    }

    /// Mutate live fields (status, stats, progress, next fire) in memory
    /// without touching disk.
    pub async fn update_live(&self, id: &str, f: impl FnOnce(&mut Task)) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.iter_mut().find(|t| t.id() == id) {
            Some(task) => {
                f(task);
                true
            }
            None => false,
        }
    }

    /// Record a completed run's timestamp and persist (last_run is a
    /// structural field).
    pub async fn record_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.iter_mut().find(|t| t.id() == id) {
            task.set_last_run(at);
            self.persist(&tasks).await?;
        }
        Ok(())
    }

    async fn persist(&self, tasks: &[Task]) -> Result<()> {
        let doc = TaskDocument {
            tasks: tasks.to_vec(),
            last_saved: Some(Utc::now()),
        };
        super::write_json_atomic(&self.path, &doc).await
    }
}

/// Reject structurally invalid records before they reach disk.
fn validate(task: &Task) -> Result<()> {
    let problem = match task {
        Task::Sync(t) => {
            if t.name.trim().is_empty() {
                Some("name must not be empty")
            } else if t.source_path.trim().is_empty() || t.target_path.trim().is_empty() {
                Some("source and target paths must not be empty")
            } else if t.source_path == t.target_path {
                Some("source and target must differ")
            } else {
                None
            }
        }
        Task::Strm(t) => {
            if t.name.trim().is_empty() {
                Some("name must not be empty")
            } else if t.source_dir.trim().is_empty() || t.target_dir.trim().is_empty() {
                Some("source and target directories must not be empty")
            } else {
                None
            }
        }
    };
    if let Some(problem) = problem {
        return Err(AppError::InvalidTask(problem.into()));
    }

    super::cron::parse(task.cron())
        .map_err(|e| AppError::InvalidTask(format!("cron: {e}")))?;
    Ok(())
}
