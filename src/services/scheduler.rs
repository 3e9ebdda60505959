//! Scheduler core.
//!
//! Owns the per-task next-fire map, the FIFO admission queue, and the set of
//! running task ids. A single loop sleeps until the earliest fire instant
//! (or an external wake), enqueues due tasks, and dispatches queued runs to
//! the matching worker while the global concurrent-run cap has headroom.
//! Manual triggers, full-overwrite, and reconstruct runs use the same
//! admission path but never move a task's next fire.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{RunKind, Task, TaskStatus};
use crate::services::cache_store::CacheStore;
use crate::services::cron;
use crate::services::log_ring::LogRing;
use crate::services::settings_store::SettingsStore;
use crate::services::strm_worker::{self, StrmRunContext};
use crate::services::sync_worker::{self, SyncRunContext};
use crate::services::task_store::TaskStore;

/// Upper bound on the scheduler sleep so task edits are picked up promptly
/// even without an explicit wake.
const MAX_SLEEP: Duration = Duration::from_secs(30);

/// One admitted run waiting for a free slot.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub task_id: String,
    pub kind: RunKind,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Default)]
struct SchedState {
    next_fire: HashMap<String, DateTime<Utc>>,
    queue: VecDeque<QueueEntry>,
    running: HashSet<String>,
}

impl SchedState {
    fn is_admitted(&self, task_id: &str) -> bool {
        self.running.contains(task_id) || self.queue.iter().any(|e| e.task_id == task_id)
    }
}

pub struct Scheduler {
    store: Arc<TaskStore>,
    settings: Arc<SettingsStore>,
    cache: Arc<CacheStore>,
    ring: Arc<LogRing>,
    state: Mutex<SchedState>,
    notify: Notify,
    cancel: CancellationToken,
    /// Global concurrent-run cap.
    cap: usize,
    stability_delay_secs: u64,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        settings: Arc<SettingsStore>,
        cache: Arc<CacheStore>,
        ring: Arc<LogRing>,
        cap: usize,
        stability_delay_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            settings,
            cache,
            ring,
            state: Mutex::new(SchedState::default()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            cap: cap.max(1),
            stability_delay_secs,
        })
    }

    /// The scheduler loop. Runs until `shutdown` is called.
    pub async fn run(self: Arc<Self>) {
        self.ring.info(
            crate::services::log_ring::GENERAL,
            format!("Scheduler started (run cap {})", self.cap),
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.refresh_next_fires().await;
            self.fire_due().await;
            Arc::clone(&self).dispatch().await;

            let sleep = self.time_until_next_fire();
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        self.ring
            .info(crate::services::log_ring::GENERAL, "Scheduler stopped");
    }

    /// Propagate cancellation to the loop and every in-flight worker.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.notify.notify_one();
    }

    // ── External events ─────────────────────────────────────────────────

    /// Manually admit a run. Same queue as scheduler fires; a task id may be
    /// admitted at most once at a time, and never while it is running.
    pub async fn trigger(&self, task_id: &str, kind: RunKind) -> Result<()> {
        let task = self
            .store
            .get(task_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;

        {
            let mut state = self.state.lock().unwrap();
            if state.is_admitted(task_id) {
                return Err(AppError::Conflict(format!(
                    "task '{}' is already queued or running",
                    task.name()
                )));
            }
            state.queue.push_back(QueueEntry {
                task_id: task_id.to_string(),
                kind,
                enqueued_at: Utc::now(),
            });
        }

        self.store
            .update_live(task_id, |t| t.set_status(TaskStatus::Queued))
            .await;
        self.ring.info(
            task_id,
            format!("Queued {:?} run for '{}'", kind, task.name()),
        );
        self.notify.notify_one();
        Ok(())
    }

    /// A task was created or edited: recompute its fire time.
    pub async fn on_task_changed(&self, task_id: &str) {
        self.state.lock().unwrap().next_fire.remove(task_id);
        self.notify.notify_one();
    }

    /// A task was removed: drop its fire entry and any queued admission.
    pub async fn on_task_removed(&self, task_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_fire.remove(task_id);
        state.queue.retain(|e| e.task_id != task_id);
        drop(state);
        self.notify.notify_one();
    }

    /// Snapshot of the admission queue, FIFO order.
    pub fn queue_view(&self) -> Vec<QueueEntry> {
        self.state.lock().unwrap().queue.iter().cloned().collect()
    }

    /// Ids with runs currently in progress.
    pub fn running_view(&self) -> Vec<String> {
        self.state.lock().unwrap().running.iter().cloned().collect()
    }

    // ── Loop internals ──────────────────────────────────────────────────

    /// Ensure every enabled task has a fire entry; drop entries for tasks
    /// that vanished or were disabled.
    async fn refresh_next_fires(&self) {
        let tasks = self.store.list().await;
        let mut wanted: HashMap<String, &Task> = HashMap::new();
        for task in &tasks {
            if task.is_enabled() {
                wanted.insert(task.id().to_string(), task);
            }
        }

        let mut computed: Vec<(String, DateTime<Utc>)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.next_fire.retain(|id, _| wanted.contains_key(id));
            for (id, task) in &wanted {
                if !state.next_fire.contains_key(id) {
                    match cron::next_fire(task.cron(), Local::now()) {
                        Ok(at) => {
                            let at = at.with_timezone(&Utc);
                            state.next_fire.insert(id.clone(), at);
                            computed.push((id.clone(), at));
                        }
                        Err(e) => {
                            tracing::warn!(task_id = %id, "cron evaluation failed: {e}");
                        }
                    }
                }
            }
        }

        for (id, at) in computed {
            self.store
                .update_live(&id, |t| t.set_next_run(Some(at)))
                .await;
        }
    }

    /// Enqueue every enabled, fireable task that is not already admitted,
    /// then advance its fire time.
    async fn fire_due(&self) {
        let now = Utc::now();
        let due: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .next_fire
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in due {
            let Some(task) = self.store.get(&id).await else {
                self.state.lock().unwrap().next_fire.remove(&id);
                continue;
            };

            // Consult nextFire after every fire to compute the subsequent one.
            let next = cron::next_fire(task.cron(), Local::now())
                .ok()
                .map(|at| at.with_timezone(&Utc));

            let admitted = {
                let mut state = self.state.lock().unwrap();
                match next {
                    Some(at) => {
                        state.next_fire.insert(id.clone(), at);
                    }
                    None => {
                        state.next_fire.remove(&id);
                    }
                }
                if task.is_enabled() && !state.is_admitted(&id) {
                    state.queue.push_back(QueueEntry {
                        task_id: id.clone(),
                        kind: task.fire_kind(),
                        enqueued_at: now,
                    });
                    true
                } else {
                    false
                }
            };

            if admitted {
                self.store
                    .update_live(&id, |t| {
                        t.set_status(TaskStatus::Queued);
                        t.set_next_run(next);
                    })
                    .await;
                self.ring
                    .info(&id, format!("Scheduled run queued for '{}'", task.name()));
            } else {
                self.store
                    .update_live(&id, |t| t.set_next_run(next))
                    .await;
            }
        }
    }

    /// Start queued runs while the run cap has headroom.
    async fn dispatch(self: Arc<Self>) {
        loop {
            let entry = {
                let mut state = self.state.lock().unwrap();
                if state.running.len() >= self.cap {
                    return;
                }
                let Some(entry) = state.queue.pop_front() else {
                    return;
                };
                state.running.insert(entry.task_id.clone());
                entry
            };

            let Some(task) = self.store.get(&entry.task_id).await else {
                self.state.lock().unwrap().running.remove(&entry.task_id);
                continue;
            };

            self.store
                .update_live(&entry.task_id, |t| t.set_status(TaskStatus::Running))
                .await;

            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                scheduler.run_task(task, entry.kind).await;
            });
        }
    }

    /// Execute one run on a fresh execution context and fold the result back
    /// into the task record.
    async fn run_task(self: Arc<Self>, task: Task, kind: RunKind) {
        let task_id = task.id().to_string();
        let settings = self.settings.get().await;
        let cancel = self.cancel.child_token();

        let result = match task {
            Task::Sync(sync_task) => {
                sync_worker::run(SyncRunContext {
                    task: sync_task,
                    kind,
                    retry_count: settings.sync_retry_count,
                    stability_delay_secs: self.stability_delay_secs,
                    cancel,
                    ring: self.ring.clone(),
                    store: self.store.clone(),
                    cache: self.cache.clone(),
                })
                .await
            }
            Task::Strm(strm_task) => {
                strm_worker::run(StrmRunContext {
                    task: strm_task,
                    kind,
                    settings,
                    cancel,
                    ring: self.ring.clone(),
                    store: self.store.clone(),
                    cache: self.cache.clone(),
                })
                .await
            }
        };

        let status = match result {
            Ok(stats) => {
                self.store
                    .update_live(&task_id, |t| t.set_stats(stats))
                    .await;
                TaskStatus::Idle
            }
            // Cancellation is not a task failure; ERROR stays sticky only
            // for real fatals.
            Err(AppError::Cancelled) => TaskStatus::Idle,
            Err(e) => {
                self.ring.warn(&task_id, format!("Run failed: {e}"));
                TaskStatus::Error
            }
        };

        if let Err(e) = self.store.record_run(&task_id, Utc::now()).await {
            tracing::warn!(%task_id, "failed to persist last run time: {e}");
        }
        self.store
            .update_live(&task_id, |t| t.set_status(status))
            .await;

        self.state.lock().unwrap().running.remove(&task_id);
        self.notify.notify_one();
    }

    /// Sleep until the earliest fire instant, clamped to [0.5s, 30s].
    fn time_until_next_fire(&self) -> Duration {
        let state = self.state.lock().unwrap();
        let earliest = state.next_fire.values().min();
        match earliest {
            Some(at) => {
                let until = (*at - Utc::now()).num_milliseconds().max(500) as u64;
                Duration::from_millis(until).min(MAX_SLEEP)
            }
            None => MAX_SLEEP,
        }
    }
}
