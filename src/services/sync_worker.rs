//! Directory sync worker.
//!
//! One invocation executes a single run of a sync task: crawl the source
//! tree, decide per file whether to copy, copy atomically through a
//! `.cgpart` sibling temp file, and finish with the delayed source-deletion
//! pass. Discovery is sequential; file processing runs on a bounded worker
//! pool. Progress counters are atomics published to the task record every
//! 500ms.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::{AppError, Result};
use crate::models::{
    RunKind, SyncCacheEntry, SyncEntryStatus, SyncTask, SyncTree, TaskProgress, TaskStats,
};
use crate::services::cache_store::CacheStore;
use crate::services::deletion;
use crate::services::log_ring::LogRing;
use crate::services::task_store::TaskStore;

/// Sibling temp suffix used for in-flight copies.
pub const TEMP_SUFFIX: &str = ".cgpart";

/// Per-file copy wall-clock limit under slow storage.
const SLOW_COPY_TIMEOUT_SECS: u64 = 600;

/// Interval between progress snapshots published to the task record.
const PROGRESS_PUBLISH_MS: u64 = 500;

/// Well-known junk entries excluded before any filter runs.
const IGNORE_NAMES: [&str; 4] = [".DS_Store", "Thumbs.db", "@eaDir", "#recycle"];

/// Everything a single run needs.
pub struct SyncRunContext {
    pub task: SyncTask,
    pub kind: RunKind,
    /// Per-file retry budget from global settings.
    pub retry_count: u32,
    /// Quiet-period length before a file is accepted as ready; 0 disables.
    pub stability_delay_secs: u64,
    pub cancel: CancellationToken,
    pub ring: Arc<LogRing>,
    pub store: Arc<TaskStore>,
    pub cache: Arc<CacheStore>,
}

/// A discovered source file.
#[derive(Debug, Clone)]
struct FileEntry {
    abs: PathBuf,
    rel: String,
    size: u64,
    mtime_secs: i64,
    mtime: SystemTime,
    created: Option<SystemTime>,
}

/// Outcome of processing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileOutcome {
    Copied,
    Unchanged,
    /// File was still growing during the quiet-period check.
    Unstable,
    Filtered,
    Failed(String),
    Cancelled,
}

#[derive(Default)]
struct Counters {
    done: AtomicU64,
    success: AtomicU64,
    skipped: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
}

/// Execute one run of a sync task.
pub async fn run(ctx: SyncRunContext) -> Result<TaskStats> {
    let task = Arc::new(ctx.task);
    let task_id = task.id.clone();
    let source_root = PathBuf::from(&task.source_path);
    let target_root = PathBuf::from(&task.target_path);

    // Fatal preconditions.
    match tokio::fs::metadata(&source_root).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return Err(AppError::SourceMissing(task.source_path.clone())),
    }
    tokio::fs::create_dir_all(&target_root)
        .await
        .map_err(|e| AppError::TargetUnwritable(format!("{}: {e}", task.target_path)))?;

    ctx.ring.info(
        &task_id,
        format!(
            "Starting {:?} run: {} -> {}",
            ctx.kind, task.source_path, task.target_path
        ),
    );

    // Leftover temp files from a crashed run are removed up front.
    let cleaned = cleanup_temp_files(target_root.clone()).await?;
    if cleaned > 0 {
        ctx.ring
            .info(&task_id, format!("Removed {cleaned} leftover {TEMP_SUFFIX} files"));
    }

    let mut cache = ctx.cache.load_sync(&task_id).await?;

    // Sequential discovery.
    let entries = Arc::new(discover(source_root.clone()).await?);
    let total = entries.len() as u64;
    ctx.ring
        .info(&task_id, format!("Discovered {total} files in source"));

    if ctx.kind == RunKind::Reconstruct {
        let stats = reconstruct(&ctx.ring, &task, &entries, &mut cache).await?;
        ctx.cache.save_sync(&task_id, &cache).await?;
        return Ok(stats);
    }

    let overwrite = ctx.kind == RunKind::FullOverwrite;
    let counters = Arc::new(Counters::default());

    // Periodic progress publisher; lock-free readers scrape the snapshot.
    let publisher = spawn_progress_publisher(
        ctx.store.clone(),
        task_id.clone(),
        counters.clone(),
        total,
    );

    let semaphore = Arc::new(Semaphore::new(task.effective_thread_count()));
    let mut pool: JoinSet<(usize, FileOutcome)> = JoinSet::new();

    for (idx, _) in entries.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");
        let task = task.clone();
        let entries = entries.clone();
        let counters = counters.clone();
        let ring = ctx.ring.clone();
        let cancel = ctx.cancel.clone();
        let target_root = target_root.clone();
        let retry_count = ctx.retry_count;
        let stability_delay = ctx.stability_delay_secs;

        pool.spawn(async move {
            let _permit = permit;
            let entry = &entries[idx];
            let outcome = process_file(
                &task,
                entry,
                &target_root,
                overwrite,
                retry_count,
                stability_delay,
                &cancel,
                &ring,
            )
            .await;
            counters.done.fetch_add(1, Ordering::Relaxed);
            match &outcome {
                FileOutcome::Copied => counters.success.fetch_add(1, Ordering::Relaxed),
                FileOutcome::Unchanged | FileOutcome::Unstable => {
                    counters.skipped.fetch_add(1, Ordering::Relaxed)
                }
                FileOutcome::Filtered => counters.filtered.fetch_add(1, Ordering::Relaxed),
                FileOutcome::Failed(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
                FileOutcome::Cancelled => 0,
            };
            (idx, outcome)
        });
    }

    // Collect outcomes and fold them into the cache tree. The cache update
    // for a file happens-after its atomic rename.
    let now = Utc::now();
    while let Some(joined) = pool.join_next().await {
        let (idx, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(%task_id, "sync worker task panicked: {e}");
                continue;
            }
        };
        apply_outcome(&mut cache, &entries[idx], &outcome, now);
    }

    publisher.abort();
    publish_progress(&ctx.store, &task_id, &counters, total).await;

    if ctx.cancel.is_cancelled() {
        ctx.cache.save_sync(&task_id, &cache).await?;
        ctx.ring.warn(&task_id, "Run cancelled, partial results saved");
        return Err(AppError::Cancelled);
    }

    // Source deletion pass: normal runs only.
    if ctx.kind == RunKind::Sync && task.delete_policy.enabled {
        let policy = task.delete_policy.clone();
        let root = source_root.clone();
        let ring = ctx.ring.clone();
        let id = task_id.clone();
        let (updated, deleted) = tokio::task::spawn_blocking(move || {
            let mut cache = cache;
            let deleted = run_deletion_pass(&root, &policy, &mut cache, Utc::now(), &ring, &id);
            (cache, deleted)
        })
        .await
        .map_err(|e| AppError::Internal(format!("deletion pass panicked: {e}")))?;
        cache = updated;
        if deleted > 0 {
            ctx.ring
                .info(&task_id, format!("Deleted {deleted} synced source files"));
        }
    }

    ctx.cache.save_sync(&task_id, &cache).await?;

    let stats = TaskStats {
        total,
        success: counters.success.load(Ordering::Relaxed),
        skipped: counters.skipped.load(Ordering::Relaxed),
        skipped_filtered: counters.filtered.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
        protection_tripped: false,
    };
    ctx.ring.info(
        &task_id,
        format!(
            "Run finished: total={} success={} skipped={} filtered={} failed={}",
            stats.total, stats.success, stats.skipped, stats.skipped_filtered, stats.failed
        ),
    );
    Ok(stats)
}

// ── Discovery ───────────────────────────────────────────────────────────────

/// Whether a directory entry is junk that never takes part in a run.
fn should_ignore(name: &str) -> bool {
    IGNORE_NAMES.contains(&name)
        || name.starts_with("~$")
        || name.ends_with(".part")
        || name.ends_with(".tmp")
        || name.ends_with(".temp")
        || name.ends_with(TEMP_SUFFIX)
}

/// Lowercased extension without the dot; empty for extensionless names.
fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Walk the source tree in filesystem order, collecting regular files.
async fn discover(root: PathBuf) -> Result<Vec<FileEntry>> {
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        let walker = WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| !should_ignore(&e.file_name().to_string_lossy()));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("walk error under {}: {e}", root.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
            files.push(FileEntry {
                abs: entry.path().to_path_buf(),
                rel,
                size: meta.len(),
                mtime_secs: system_time_secs(mtime),
                mtime,
                created: meta.created().ok(),
            });
        }
        Ok(files)
    })
    .await
    .map_err(|e| AppError::Internal(format!("discovery panicked: {e}")))?
}

fn system_time_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn to_datetime(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

// ── Per-file processing ─────────────────────────────────────────────────────

/// Decide whether a file must be copied, given the enabled rule union.
///
/// `target` is `(size, mtime_secs)` of the existing target file, if any.
/// Mtime comparison carries a one-second tolerance for coarse filesystems.
fn should_copy(
    rules: (bool, bool, bool),
    src_size: u64,
    src_mtime_secs: i64,
    target: Option<(u64, i64)>,
) -> bool {
    let (not_exists, size_diff, mtime_newer) = rules;
    match target {
        None => not_exists,
        Some((t_size, t_mtime)) => {
            (size_diff && t_size != src_size) || (mtime_newer && src_mtime_secs > t_mtime + 1)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_file(
    task: &SyncTask,
    entry: &FileEntry,
    target_root: &Path,
    overwrite: bool,
    retry_count: u32,
    stability_delay_secs: u64,
    cancel: &CancellationToken,
    ring: &LogRing,
) -> FileOutcome {
    if cancel.is_cancelled() {
        return FileOutcome::Cancelled;
    }

    // Filters, cheapest first.
    let ext = extension_of(Path::new(&entry.rel));
    if !task.suffix_filter.admits(&ext) {
        return FileOutcome::Filtered;
    }
    if !task.size_filter.admits(entry.size) {
        return FileOutcome::Filtered;
    }

    let target = target_root.join(&entry.rel);
    if !overwrite {
        let target_meta = tokio::fs::metadata(&target).await.ok().map(|m| {
            (
                m.len(),
                system_time_secs(m.modified().unwrap_or(UNIX_EPOCH)),
            )
        });
        if !should_copy(
            task.effective_rules(),
            entry.size,
            entry.mtime_secs,
            target_meta,
        ) {
            return FileOutcome::Unchanged;
        }
    }

    // Quiet-period check: a file whose size is still moving is not ready.
    if stability_delay_secs > 0 {
        tokio::time::sleep(std::time::Duration::from_secs(stability_delay_secs)).await;
        match tokio::fs::metadata(&entry.abs).await {
            Ok(meta) if meta.len() == entry.size => {}
            _ => {
                ring.info(&task.id, format!("Skipping active file: {}", entry.rel));
                return FileOutcome::Unstable;
            }
        }
    }

    // Copy with retries and exponential backoff.
    let max_attempts = retry_count + 1;
    let mut delay_secs = if task.is_slow_storage { 5 } else { 1 };
    let mut last_error = String::new();

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return FileOutcome::Cancelled;
        }
        if attempt > 0 {
            ring.info(
                &task.id,
                format!("Retrying ({attempt}/{retry_count}): {}", entry.rel),
            );
            tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
            delay_secs = (delay_secs * 2).min(30);
        }

        match copy_attempt(entry, &target, task.is_slow_storage).await {
            Ok(()) => return FileOutcome::Copied,
            Err(e) => {
                last_error = e;
                ring.warn(
                    &task.id,
                    format!(
                        "Copy failed (attempt {}/{}): {} - {last_error}",
                        attempt + 1,
                        max_attempts,
                        entry.rel
                    ),
                );
            }
        }
    }

    FileOutcome::Failed(last_error)
}

/// One copy attempt: blocking atomic copy, time-limited under slow storage.
async fn copy_attempt(entry: &FileEntry, target: &Path, slow_storage: bool) -> std::result::Result<(), String> {
    let src = entry.abs.clone();
    let dst = target.to_path_buf();
    let mtime = entry.mtime;
    let expected_size = entry.size;

    let copy = tokio::task::spawn_blocking(move || copy_file_atomic(&src, &dst, mtime, expected_size));

    let joined = if slow_storage {
        match tokio::time::timeout(
            std::time::Duration::from_secs(SLOW_COPY_TIMEOUT_SECS),
            copy,
        )
        .await
        {
            Ok(joined) => joined,
            Err(_) => return Err(format!("copy timed out after {SLOW_COPY_TIMEOUT_SECS}s")),
        }
    } else {
        copy.await
    };

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("copy task panicked: {e}")),
    }
}

/// Copy `src` to `dst` through a sibling `.cgpart` temp file: byte copy,
/// flush, mtime preservation, then atomic rename. The temp file is removed
/// on any failure.
fn copy_file_atomic(
    src: &Path,
    dst: &Path,
    mtime: SystemTime,
    expected_size: u64,
) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dst.with_file_name(format!("{file_name}{TEMP_SUFFIX}"));

    let result = (|| -> std::io::Result<()> {
        let mut reader = std::fs::File::open(src)?;
        let mut writer = std::fs::File::create(&temp)?;
        let copied = std::io::copy(&mut reader, &mut writer)?;
        writer.sync_all()?;
        if copied != expected_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("size check failed: expected {expected_size}, wrote {copied}"),
            ));
        }
        writer.set_modified(mtime)?;
        drop(writer);
        std::fs::rename(&temp, dst)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result
}

/// Fold a file outcome into the cache tree.
fn apply_outcome(cache: &mut SyncTree, entry: &FileEntry, outcome: &FileOutcome, now: DateTime<Utc>) {
    let file_create = entry
        .created
        .map(to_datetime)
        .or_else(|| Some(to_datetime(entry.mtime)));

    match outcome {
        FileOutcome::Copied => {
            let existing_create = cache
                .entries
                .get(&entry.rel)
                .and_then(|e| e.file_create);
            cache.entries.insert(
                entry.rel.clone(),
                SyncCacheEntry {
                    size: entry.size,
                    mtime: entry.mtime_secs,
                    status: SyncEntryStatus::Synced,
                    last_sync: Some(now),
                    file_create: existing_create.or(file_create),
                },
            );
        }
        FileOutcome::Unchanged => {
            // A file that already reached the target keeps its SYNCED entry
            // so delayed deletion still sees it; anything else records the
            // visit as skipped.
            let keep_synced = cache.entries.get(&entry.rel).is_some_and(|e| {
                e.status == SyncEntryStatus::Synced
                    && e.size == entry.size
                    && e.mtime == entry.mtime_secs
            });
            if !keep_synced {
                cache.entries.insert(
                    entry.rel.clone(),
                    SyncCacheEntry {
                        size: entry.size,
                        mtime: entry.mtime_secs,
                        status: SyncEntryStatus::Skipped,
                        last_sync: cache.entries.get(&entry.rel).and_then(|e| e.last_sync),
                        file_create,
                    },
                );
            }
        }
        FileOutcome::Unstable => {
            cache.entries.insert(
                entry.rel.clone(),
                SyncCacheEntry {
                    size: entry.size,
                    mtime: entry.mtime_secs,
                    status: SyncEntryStatus::Pending,
                    last_sync: cache.entries.get(&entry.rel).and_then(|e| e.last_sync),
                    file_create,
                },
            );
        }
        FileOutcome::Failed(_) => {
            cache.entries.insert(
                entry.rel.clone(),
                SyncCacheEntry {
                    size: entry.size,
                    mtime: entry.mtime_secs,
                    status: SyncEntryStatus::Failed,
                    last_sync: cache.entries.get(&entry.rel).and_then(|e| e.last_sync),
                    file_create,
                },
            );
        }
        FileOutcome::Filtered | FileOutcome::Cancelled => {}
    }
}

// ── Reconstruct mode ────────────────────────────────────────────────────────

/// Rebuild cache entries from an already-populated target: every source file
/// whose target counterpart exists with matching size becomes SYNCED so the
/// next incremental run skips it.
async fn reconstruct(
    ring: &LogRing,
    task: &SyncTask,
    entries: &[FileEntry],
    cache: &mut SyncTree,
) -> Result<TaskStats> {
    let target_root = PathBuf::from(&task.target_path);
    let now = Utc::now();
    let mut matched = 0u64;

    for entry in entries {
        let target = target_root.join(&entry.rel);
        let Ok(meta) = tokio::fs::metadata(&target).await else {
            continue;
        };
        if meta.len() != entry.size {
            continue;
        }
        matched += 1;
        cache.entries.insert(
            entry.rel.clone(),
            SyncCacheEntry {
                size: entry.size,
                mtime: entry.mtime_secs,
                status: SyncEntryStatus::Synced,
                last_sync: Some(now),
                file_create: entry.created.map(to_datetime).or(Some(to_datetime(entry.mtime))),
            },
        );
    }

    ring.info(
        &task.id,
        format!(
            "Reconstructed cache: {matched} of {} files matched the target",
            entries.len()
        ),
    );
    Ok(TaskStats {
        total: entries.len() as u64,
        success: 0,
        skipped: matched,
        skipped_filtered: 0,
        failed: 0,
        protection_tripped: false,
    })
}

// ── Deletion pass ───────────────────────────────────────────────────────────

/// Remove source files whose cache entries are due per the deletion planner,
/// then ascend up to `parent_levels` removing directories. Blocking.
fn run_deletion_pass(
    source_root: &Path,
    policy: &crate::models::DeletePolicy,
    cache: &mut SyncTree,
    now: DateTime<Utc>,
    ring: &LogRing,
    task_id: &str,
) -> u64 {
    let mut deleted = 0u64;
    let candidates = cache.synced_paths();

    for rel in candidates {
        let Some(entry) = cache.entries.get(&rel) else { continue };
        let decision = deletion::plan(policy, entry, now);
        if !decision.delete {
            continue;
        }

        let abs = source_root.join(&rel);
        let removed = match std::fs::remove_file(&abs) {
            Ok(()) => true,
            // Already gone counts as removed.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                ring.warn(task_id, format!("Failed to delete source file {rel}: {e}"));
                false
            }
        };
        if !removed {
            continue;
        }

        deleted += 1;
        if let Some(entry) = cache.entries.get_mut(&rel) {
            entry.status = SyncEntryStatus::Deleted;
        }
        ring.info(task_id, format!("Deleted source file: {rel}"));
        if decision.ascend_levels > 0 {
            ascend_directories(
                source_root,
                abs.parent(),
                decision.ascend_levels,
                policy,
                cache,
                now,
            );
        }
    }

    deleted
}

/// Remove parent directories from leaf upward, at most `levels` deep, never
/// leaving the source root. A directory goes only if it is empty, or if the
/// force flag is set and nothing under it is still waiting for its deletion
/// day.
fn ascend_directories(
    source_root: &Path,
    start: Option<&Path>,
    levels: u32,
    policy: &crate::models::DeletePolicy,
    cache: &SyncTree,
    now: DateTime<Utc>,
) {
    let mut dir = match start {
        Some(d) => d.to_path_buf(),
        None => return,
    };

    for _ in 0..levels {
        if dir == source_root || !dir.starts_with(source_root) {
            return;
        }

        let empty = match std::fs::read_dir(&dir) {
            Ok(mut it) => it.next().is_none(),
            Err(_) => return,
        };

        let removed = if empty {
            std::fs::remove_dir(&dir).is_ok()
        } else if policy.force_delete_nonempty
            && !has_not_due_files(source_root, &dir, policy, cache, now)
        {
            std::fs::remove_dir_all(&dir).is_ok()
        } else {
            return;
        };

        if !removed {
            return;
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => return,
        }
    }
}

/// Whether any file under `dir` must veto its removal: files not yet due for
/// deletion (including untracked ones) always do.
fn has_not_due_files(
    source_root: &Path,
    dir: &Path,
    policy: &crate::models::DeletePolicy,
    cache: &SyncTree,
    now: DateTime<Utc>,
) -> bool {
    for entry in WalkDir::new(dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source_root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        match cache.entries.get(&rel) {
            Some(cached) if deletion::plan(policy, cached, now).delete => {}
            _ => return true,
        }
    }
    false
}

// ── Housekeeping ────────────────────────────────────────────────────────────

/// Remove leftover `.cgpart` files below the target root.
async fn cleanup_temp_files(target_root: PathBuf) -> Result<u64> {
    tokio::task::spawn_blocking(move || {
        let mut removed = 0u64;
        for entry in WalkDir::new(&target_root).into_iter().flatten() {
            if entry.file_type().is_file()
                && entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX)
                && std::fs::remove_file(entry.path()).is_ok()
            {
                removed += 1;
            }
        }
        Ok(removed)
    })
    .await
    .map_err(|e| AppError::Internal(format!("temp cleanup panicked: {e}")))?
}

fn spawn_progress_publisher(
    store: Arc<TaskStore>,
    task_id: String,
    counters: Arc<Counters>,
    total: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(PROGRESS_PUBLISH_MS)).await;
            publish_progress(&store, &task_id, &counters, total).await;
        }
    })
}

async fn publish_progress(store: &TaskStore, task_id: &str, counters: &Counters, total: u64) {
    let done = counters.done.load(Ordering::Relaxed);
    let progress = TaskProgress {
        done,
        total,
        success: counters.success.load(Ordering::Relaxed),
        skipped: counters.skipped.load(Ordering::Relaxed)
            + counters.filtered.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
        percent: TaskProgress::percent_of(done, total),
    };
    store
        .update_live(task_id, |task| task.set_progress(progress))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DeletePolicy, DeleteTimeBase, SizeFilter, SuffixFilter, SuffixMode, TaskStatus,
    };

    fn base_task(source: &Path, target: &Path) -> SyncTask {
        SyncTask {
            id: "t1".into(),
            name: "t1".into(),
            source_path: source.to_string_lossy().into_owned(),
            target_path: target.to_string_lossy().into_owned(),
            cron: "*/5 * * * *".into(),
            thread_count: 1,
            is_slow_storage: false,
            rule_not_exists: true,
            rule_size_diff: false,
            rule_mtime_newer: false,
            size_filter: SizeFilter::default(),
            suffix_filter: SuffixFilter::default(),
            delete_policy: DeletePolicy::default(),
            enabled: true,
            last_run: None,
            status: TaskStatus::Idle,
            stats: Default::default(),
            progress: Default::default(),
            next_run: None,
        }
    }

    struct Fixture {
        _config: tempfile::TempDir,
        source: tempfile::TempDir,
        target: tempfile::TempDir,
        store: Arc<TaskStore>,
        cache: Arc<CacheStore>,
        ring: Arc<LogRing>,
    }

    async fn fixture() -> Fixture {
        let config = tempfile::tempdir().unwrap();
        let store = Arc::new(
            TaskStore::load(config.path().join("tasks.json"))
                .await
                .unwrap(),
        );
        let cache = Arc::new(CacheStore::new(config.path().join("cache")));
        Fixture {
            source: tempfile::tempdir().unwrap(),
            target: tempfile::tempdir().unwrap(),
            store,
            cache,
            ring: Arc::new(LogRing::new()),
            _config: config,
        }
    }

    fn ctx_for(f: &Fixture, task: SyncTask, kind: RunKind) -> SyncRunContext {
        SyncRunContext {
            task,
            kind,
            retry_count: 0,
            stability_delay_secs: 0,
            cancel: CancellationToken::new(),
            ring: f.ring.clone(),
            store: f.store.clone(),
            cache: f.cache.clone(),
        }
    }

    // ── Pure helpers ────────────────────────────────────────────────────

    #[test]
    fn test_should_ignore_junk() {
        assert!(should_ignore(".DS_Store"));
        assert!(should_ignore("Thumbs.db"));
        assert!(should_ignore("~$report.docx"));
        assert!(should_ignore("movie.mkv.part"));
        assert!(should_ignore("a.mkv.cgpart"));
        assert!(!should_ignore("movie.mkv"));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of(Path::new("a/b/Movie.MKV")), "mkv");
        assert_eq!(extension_of(Path::new("README")), "");
        assert_eq!(extension_of(Path::new(".hidden")), "");
    }

    #[test]
    fn test_should_copy_not_exists_rule() {
        let rules = (true, false, false);
        assert!(should_copy(rules, 10, 0, None));
        assert!(!should_copy(rules, 10, 0, Some((10, 0))));
        assert!(!should_copy(rules, 10, 0, Some((99, 0))));
    }

    #[test]
    fn test_should_copy_size_diff_rule() {
        let rules = (false, true, false);
        // size_diff alone does not cover missing targets
        assert!(!should_copy(rules, 10, 0, None));
        assert!(should_copy(rules, 10, 0, Some((11, 0))));
        assert!(!should_copy(rules, 10, 0, Some((10, 0))));
    }

    #[test]
    fn test_should_copy_mtime_tolerance() {
        let rules = (false, false, true);
        assert!(!should_copy(rules, 10, 100, Some((10, 100))));
        // within the 1s tolerance
        assert!(!should_copy(rules, 10, 101, Some((10, 100))));
        assert!(should_copy(rules, 10, 102, Some((10, 100))));
    }

    #[test]
    fn test_should_copy_union() {
        let rules = (true, true, false);
        assert!(should_copy(rules, 10, 0, None));
        assert!(should_copy(rules, 10, 0, Some((11, 0))));
        assert!(!should_copy(rules, 10, 0, Some((10, 0))));
    }

    #[test]
    fn test_copy_file_atomic_preserves_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        let dst = dir.path().join("out/a.bin");
        std::fs::write(&src, b"hello").unwrap();
        let mtime = UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
        let src_file = std::fs::File::open(&src).unwrap();
        src_file.set_modified(mtime).unwrap();

        copy_file_atomic(&src, &dst, mtime, 5).unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
        let dst_mtime = std::fs::metadata(&dst).unwrap().modified().unwrap();
        assert_eq!(system_time_secs(dst_mtime), 1_600_000_000);
        assert!(!dst.with_file_name("a.bin.cgpart").exists());
    }

    #[test]
    fn test_copy_file_atomic_cleans_temp_on_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        let dst = dir.path().join("a-copy.bin");
        std::fs::write(&src, b"hello").unwrap();

        let result = copy_file_atomic(&src, &dst, SystemTime::now(), 999);
        assert!(result.is_err());
        assert!(!dst.exists());
        assert!(!dst.with_file_name("a-copy.bin.cgpart").exists());
    }

    // ── End-to-end runs ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_first_run_copies_second_run_skips() {
        let f = fixture().await;
        std::fs::write(f.source.path().join("a.mkv"), vec![7u8; 1024]).unwrap();
        let task = base_task(f.source.path(), f.target.path());

        let stats = run(ctx_for(&f, task.clone(), RunKind::Sync)).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.success, 1);
        assert!(f.target.path().join("a.mkv").exists());

        let stats = run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.success, 0);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_empty_source_yields_zero_total() {
        let f = fixture().await;
        let task = base_task(f.source.path(), f.target.path());
        let stats = run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn test_missing_source_is_fatal() {
        let f = fixture().await;
        let mut task = base_task(f.source.path(), f.target.path());
        task.source_path = "/definitely/not/here".into();
        let err = run(ctx_for(&f, task, RunKind::Sync)).await.unwrap_err();
        assert!(matches!(err, AppError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn test_suffix_exclude_filter() {
        let f = fixture().await;
        std::fs::write(f.source.path().join("a.mkv"), b"video").unwrap();
        std::fs::write(f.source.path().join("b.nfo"), b"meta").unwrap();
        let mut task = base_task(f.source.path(), f.target.path());
        task.suffix_filter = SuffixFilter {
            mode: SuffixMode::Exclude,
            list: vec!["nfo".into()],
        };

        let stats = run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert_eq!(stats.success, 1);
        assert_eq!(stats.skipped_filtered, 1);
        assert!(f.target.path().join("a.mkv").exists());
        assert!(!f.target.path().join("b.nfo").exists());
    }

    #[tokio::test]
    async fn test_size_filter_boundary_inclusive() {
        let f = fixture().await;
        std::fs::write(f.source.path().join("exact.bin"), vec![0u8; 100]).unwrap();
        std::fs::write(f.source.path().join("big.bin"), vec![0u8; 101]).unwrap();
        let mut task = base_task(f.source.path(), f.target.path());
        task.size_filter = SizeFilter {
            min_bytes: None,
            max_bytes: Some(100),
        };

        let stats = run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert_eq!(stats.success, 1);
        assert_eq!(stats.skipped_filtered, 1);
        assert!(f.target.path().join("exact.bin").exists());
    }

    #[tokio::test]
    async fn test_size_diff_triggers_resync() {
        let f = fixture().await;
        let src_file = f.source.path().join("a.mkv");
        std::fs::write(&src_file, vec![1u8; 100]).unwrap();
        let mut task = base_task(f.source.path(), f.target.path());
        task.rule_size_diff = true;

        run(ctx_for(&f, task.clone(), RunKind::Sync)).await.unwrap();

        // Overwrite in place with different content size.
        std::fs::write(&src_file, vec![2u8; 200]).unwrap();
        let stats = run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert_eq!(stats.success, 1);
        assert_eq!(
            std::fs::metadata(f.target.path().join("a.mkv")).unwrap().len(),
            200
        );
    }

    #[tokio::test]
    async fn test_full_overwrite_then_normal_run_skips() {
        let f = fixture().await;
        std::fs::write(f.source.path().join("a.mkv"), vec![1u8; 64]).unwrap();
        let task = base_task(f.source.path(), f.target.path());

        let stats = run(ctx_for(&f, task.clone(), RunKind::FullOverwrite))
            .await
            .unwrap();
        assert_eq!(stats.success, 1);

        let stats = run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert_eq!(stats.success, 0);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_full_overwrite_recopies_unchanged_files() {
        let f = fixture().await;
        std::fs::write(f.source.path().join("a.mkv"), vec![1u8; 64]).unwrap();
        let task = base_task(f.source.path(), f.target.path());

        run(ctx_for(&f, task.clone(), RunKind::Sync)).await.unwrap();
        let stats = run(ctx_for(&f, task, RunKind::FullOverwrite))
            .await
            .unwrap();
        assert_eq!(stats.success, 1);
    }

    #[tokio::test]
    async fn test_reconstruct_then_normal_run_skips() {
        let f = fixture().await;
        std::fs::write(f.source.path().join("a.mkv"), vec![1u8; 64]).unwrap();
        // Target already carries an identical copy, produced out of band.
        std::fs::write(f.target.path().join("a.mkv"), vec![1u8; 64]).unwrap();
        let task = base_task(f.source.path(), f.target.path());

        let stats = run(ctx_for(&f, task.clone(), RunKind::Reconstruct))
            .await
            .unwrap();
        assert_eq!(stats.skipped, 1);

        let stats = run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert_eq!(stats.success, 0);
    }

    #[tokio::test]
    async fn test_leftover_temp_files_are_cleaned() {
        let f = fixture().await;
        std::fs::write(f.target.path().join("a.mkv.cgpart"), b"partial").unwrap();
        let task = base_task(f.source.path(), f.target.path());
        run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert!(!f.target.path().join("a.mkv.cgpart").exists());
    }

    #[tokio::test]
    async fn test_immediate_source_deletion_after_sync() {
        let f = fixture().await;
        std::fs::write(f.source.path().join("x.mp4"), vec![5u8; 32]).unwrap();
        let mut task = base_task(f.source.path(), f.target.path());
        task.delete_policy = DeletePolicy {
            enabled: true,
            delay_days: 0,
            time_base: DeleteTimeBase::SyncComplete,
            delete_parent: false,
            parent_levels: 0,
            force_delete_nonempty: false,
        };

        let stats = run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert_eq!(stats.success, 1);
        assert!(!f.source.path().join("x.mp4").exists());
        assert!(f.target.path().join("x.mp4").exists());

        let cache = f.cache.load_sync("t1").await.unwrap();
        assert_eq!(cache.entries["x.mp4"].status, SyncEntryStatus::Deleted);
    }

    #[tokio::test]
    async fn test_parent_directory_removed_when_empty() {
        let f = fixture().await;
        std::fs::create_dir_all(f.source.path().join("show/season1")).unwrap();
        std::fs::write(
            f.source.path().join("show/season1/ep1.mkv"),
            vec![5u8; 32],
        )
        .unwrap();
        let mut task = base_task(f.source.path(), f.target.path());
        task.delete_policy = DeletePolicy {
            enabled: true,
            delay_days: 0,
            time_base: DeleteTimeBase::SyncComplete,
            delete_parent: true,
            parent_levels: 2,
            force_delete_nonempty: false,
        };

        run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert!(!f.source.path().join("show").exists());
        assert!(f.source.path().exists());
    }

    #[tokio::test]
    async fn test_nonempty_parent_survives_without_force() {
        let f = fixture().await;
        std::fs::create_dir_all(f.source.path().join("show")).unwrap();
        std::fs::write(f.source.path().join("show/ep1.mkv"), vec![5u8; 32]).unwrap();
        std::fs::write(f.source.path().join("show/notes.txt"), b"keep").unwrap();
        let mut task = base_task(f.source.path(), f.target.path());
        task.suffix_filter = SuffixFilter {
            mode: SuffixMode::Include,
            list: vec!["mkv".into()],
        };
        task.delete_policy = DeletePolicy {
            enabled: true,
            delay_days: 0,
            time_base: DeleteTimeBase::SyncComplete,
            delete_parent: true,
            parent_levels: 1,
            force_delete_nonempty: false,
        };

        run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert!(!f.source.path().join("show/ep1.mkv").exists());
        assert!(f.source.path().join("show/notes.txt").exists());
    }

    #[tokio::test]
    async fn test_deletion_skipped_during_full_overwrite() {
        let f = fixture().await;
        std::fs::write(f.source.path().join("x.mp4"), vec![5u8; 32]).unwrap();
        let mut task = base_task(f.source.path(), f.target.path());
        task.delete_policy.enabled = true;

        run(ctx_for(&f, task, RunKind::FullOverwrite)).await.unwrap();
        assert!(f.source.path().join("x.mp4").exists());
    }

    #[tokio::test]
    async fn test_junk_files_not_counted() {
        let f = fixture().await;
        std::fs::write(f.source.path().join(".DS_Store"), b"junk").unwrap();
        std::fs::write(f.source.path().join("a.mkv"), b"video").unwrap();
        let task = base_task(f.source.path(), f.target.path());
        let stats = run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert_eq!(stats.total, 1);
        assert!(!f.target.path().join(".DS_Store").exists());
    }

    #[tokio::test]
    async fn test_cancelled_run_returns_cancelled() {
        let f = fixture().await;
        std::fs::write(f.source.path().join("a.mkv"), b"video").unwrap();
        let task = base_task(f.source.path(), f.target.path());
        let mut ctx = ctx_for(&f, task, RunKind::Sync);
        ctx.cancel = CancellationToken::new();
        ctx.cancel.cancel();
        let err = run(ctx).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }

    #[tokio::test]
    async fn test_multithreaded_run_copies_everything() {
        let f = fixture().await;
        for i in 0..12 {
            std::fs::write(f.source.path().join(format!("f{i}.bin")), vec![i as u8; 64]).unwrap();
        }
        let mut task = base_task(f.source.path(), f.target.path());
        task.thread_count = 4;

        let stats = run(ctx_for(&f, task, RunKind::Sync)).await.unwrap();
        assert_eq!(stats.total, 12);
        assert_eq!(stats.success, 12);
        for i in 0..12 {
            assert!(f.target.path().join(format!("f{i}.bin")).exists());
        }
    }
}
