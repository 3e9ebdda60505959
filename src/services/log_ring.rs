//! Per-task bounded log rings.
//!
//! Each task id owns a ring of timestamped lines capped at `CAPACITY`;
//! eviction is O(1) oldest-dropped. The special id `"general"` receives a
//! copy of every line and everything also flows through `tracing` into the
//! file log.

use chrono::Local;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Ring id receiving a copy of every line.
pub const GENERAL: &str = "general";

const CAPACITY: usize = 1000;

/// Shared in-memory log rings, keyed by task id.
#[derive(Default)]
pub struct LogRing {
    rings: Mutex<HashMap<String, VecDeque<String>>>,
}

impl LogRing {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(rings: &mut HashMap<String, VecDeque<String>>, id: &str, line: &str) {
        let ring = rings.entry(id.to_string()).or_default();
        if ring.len() == CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line.to_string());
    }

    /// Record a line for a task (and the general ring) at info level.
    pub fn info(&self, task_id: &str, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(task_id, "{message}");
        self.push(task_id, message);
    }

    /// Record a line for a task (and the general ring) at warn level.
    pub fn warn(&self, task_id: &str, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!(task_id, "{message}");
        self.push(task_id, message);
    }

    fn push(&self, task_id: &str, message: &str) {
        let line = format!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
        let mut rings = self.rings.lock().unwrap();
        Self::append(&mut rings, GENERAL, &line);
        if task_id != GENERAL {
            Self::append(&mut rings, task_id, &line);
        }
    }

    /// Snapshot of a ring, oldest first.
    pub fn get(&self, task_id: &str) -> Vec<String> {
        self.rings
            .lock()
            .unwrap()
            .get(task_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, task_id: &str) {
        self.rings.lock().unwrap().remove(task_id);
    }

    /// Drop the ring of a deleted task.
    pub fn remove(&self, task_id: &str) {
        self.clear(task_id);
    }
}
