//! Core services: persistence stores, cron evaluation, workers, scheduler.

pub mod cache_store;
pub mod cron;
pub mod deletion;
pub mod log_ring;
pub mod openlist_client;
pub mod scheduler;
pub mod settings_store;
pub mod strm_worker;
pub mod sync_worker;
pub mod task_store;

use std::path::Path;

use crate::error::Result;

/// Write a JSON document via write-temp-then-rename.
///
/// Only same-directory rename atomicity is assumed of the target filesystem,
/// so the temp file is a sibling of the destination.
pub(crate) async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e.into())
        }
    }
}
