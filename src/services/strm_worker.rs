//! STRM generation worker.
//!
//! One invocation executes a single run of an STRM task: crawl the remote
//! tree through the OpenList list API, materialize `.strm` pointer files and
//! selected companion files under the local target directory, and maintain
//! the per-task cache tree whose per-leaf absence counters back the
//! anti-mass-delete safeguard.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::error::{AppError, Result};
use crate::models::{
    RunKind, Settings, SmartProtection, StrmLeaf, StrmMode, StrmTask, StrmTree, TaskProgress,
    TaskStats,
};
use crate::services::cache_store::CacheStore;
use crate::services::log_ring::LogRing;
use crate::services::openlist_client::{OpenListClient, OpenListConfig};
use crate::services::task_store::TaskStore;

/// Page size for remote directory listings.
const LIST_PAGE_SIZE: u32 = 100;

/// Everything a single STRM run needs.
pub struct StrmRunContext {
    pub task: StrmTask,
    pub kind: RunKind,
    pub settings: Settings,
    pub cancel: CancellationToken,
    pub ring: Arc<LogRing>,
    pub store: Arc<TaskStore>,
    pub cache: Arc<CacheStore>,
}

/// A remote video file selected for `.strm` generation.
#[derive(Debug, Clone)]
struct RemoteVideo {
    full_path: String,
    size: u64,
    sign: String,
    raw_url: Option<String>,
}

/// A remote companion file (subtitle/image/nfo) to mirror locally.
#[derive(Debug, Clone)]
struct RemoteExtra {
    full_path: String,
    sign: String,
}

/// Execute one run of an STRM task.
pub async fn run(ctx: StrmRunContext) -> Result<TaskStats> {
    let task = Arc::new(ctx.task.clone());
    let task_id = task.id.clone();
    let target_root = PathBuf::from(&task.target_dir);

    tokio::fs::create_dir_all(&target_root)
        .await
        .map_err(|e| AppError::TargetUnwritable(format!("{}: {e}", task.target_dir)))?;

    if ctx.kind == RunKind::Reconstruct {
        let mut tree = StrmTree {
            root: task.source_dir.clone(),
            ..Default::default()
        };
        let stats = reconstruct(&ctx, &task, &target_root, &mut tree).await?;
        ctx.cache.save_strm(&task_id, &tree).await?;
        return Ok(stats);
    }

    if !ctx.settings.openlist.is_configured() {
        return Err(AppError::Remote(
            "OpenList server is not configured".into(),
        ));
    }
    let client = Arc::new(
        OpenListClient::new(OpenListConfig::from_settings(&ctx.settings.openlist, false))
            .map_err(AppError::from)?,
    );

    ctx.ring.info(
        &task_id,
        format!(
            "Starting {:?} STRM run: {} -> {} (mode {:?})",
            ctx.kind, task.source_dir, task.target_dir, task.mode
        ),
    );

    let overwrite = ctx.kind == RunKind::FullOverwrite;
    let mut tree = if overwrite {
        // Full overwrite rebuilds the cache from scratch.
        StrmTree::default()
    } else {
        ctx.cache.load_strm(&task_id).await?
    };
    tree.root = task.source_dir.clone();
    tree.scan_count += 1;
    let scan = tree.scan_count;

    // ── Remote crawl ────────────────────────────────────────────────────

    let (videos, extras) = crawl_remote(&ctx, &task, &client).await?;
    let videos = select_bdmv_mains(videos);
    let total = videos.len() as u64;
    ctx.ring.info(
        &task_id,
        format!("Found {total} video files, {} companion files", extras.len()),
    );

    // Every video observed remotely counts for the absence bookkeeping,
    // whether or not its local materialization succeeds.
    let observed: BTreeSet<String> = videos
        .iter()
        .filter_map(|v| strm_rel_path(&task.source_dir, &v.full_path, task.flatten_mode))
        .collect();

    // ── Generation ──────────────────────────────────────────────────────

    let counters = Arc::new(GenCounters::default());
    let publisher = spawn_progress_publisher(
        ctx.store.clone(),
        task_id.clone(),
        counters.clone(),
        total,
    );

    let semaphore = Arc::new(Semaphore::new(task.effective_workers()));
    let mut pool: JoinSet<Option<(String, String)>> = JoinSet::new();

    for video in videos {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let Some(strm_rel) = strm_rel_path(&task.source_dir, &video.full_path, task.flatten_mode)
        else {
            continue;
        };
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");
        let task = Arc::clone(&task);
        let client = client.clone();
        let counters = counters.clone();
        let ring = ctx.ring.clone();
        let target_root = target_root.clone();

        pool.spawn(async move {
            let _permit = permit;
            let local = target_root.join(&strm_rel);
            let content = strm_content(task.mode, &client, &video);

            let outcome = write_if_changed(&local, content.as_bytes(), overwrite).await;
            counters.done.fetch_add(1, Ordering::Relaxed);
            match outcome {
                Ok(true) => {
                    counters.created.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    ring.warn(
                        &task.id,
                        format!("Failed to write strm for {}: {e}", video.full_path),
                    );
                    return None;
                }
            }
            Some((strm_rel, video.full_path))
        });
    }

    // Leaves are updated once their .strm is in place on disk.
    let mut ensured: BTreeMap<String, String> = BTreeMap::new();
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(Some((strm_rel, remote_path))) => {
                ensured.insert(strm_rel, remote_path);
            }
            Ok(None) => {}
            Err(e) => tracing::error!(%task_id, "strm worker task panicked: {e}"),
        }
    }

    publisher.abort();
    publish_progress(&ctx.store, &task_id, &counters, total).await;

    if ctx.cancel.is_cancelled() {
        ctx.cache.save_strm(&task_id, &tree).await?;
        ctx.ring.warn(&task_id, "Run cancelled, partial results saved");
        return Err(AppError::Cancelled);
    }

    // ── Companion files ─────────────────────────────────────────────────

    let mut extra_synced = 0u64;
    let mut extras_by_dir: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for extra in &extras {
        let Some(rel) = rel_path(&task.source_dir, &extra.full_path, task.flatten_mode) else {
            continue;
        };
        let local = target_root.join(&rel);
        let exists = tokio::fs::try_exists(&local).await.unwrap_or(false);
        if exists && !overwrite {
            continue;
        }
        match client.download(&extra.full_path, &extra.sign).await {
            Ok(bytes) => match write_atomic(&local, &bytes).await {
                Ok(()) => {
                    extra_synced += 1;
                    extras_by_dir
                        .entry(parent_and_stem(&rel))
                        .or_default()
                        .push(rel);
                }
                Err(e) => ctx
                    .ring
                    .warn(&task_id, format!("Failed to write {rel}: {e}")),
            },
            Err(e) => ctx.ring.warn(
                &task_id,
                format!("Failed to download {}: {e}", extra.full_path),
            ),
        }
    }
    if extra_synced > 0 {
        ctx.ring
            .info(&task_id, format!("Synced {extra_synced} companion files"));
    }

    for (strm_rel, remote_path) in &ensured {
        let extra_files = extras_by_dir
            .get(&parent_and_stem(strm_rel))
            .cloned()
            .unwrap_or_default();
        tree.leaves.insert(
            strm_rel.clone(),
            StrmLeaf {
                remote_path: remote_path.clone(),
                extra_files,
                last_seen_scan: scan,
                miss_count: 0,
            },
        );
    }

    // ── Bidirectional deletion ──────────────────────────────────────────

    let mut protection_tripped = false;
    if task.sync_server_delete {
        let plan = plan_server_deletions(&mut tree, &observed, &task.protection, scan);
        if plan.tripped {
            protection_tripped = true;
            ctx.ring.warn(
                &task_id,
                format!(
                    "protection tripped: {} missing leaves exceed threshold {}, deletion phase skipped",
                    plan.missing_count, task.protection.threshold
                ),
            );
        } else {
            let mut deleted = 0u64;
            for key in &plan.delete_keys {
                if let Some(leaf) = tree.leaves.remove(key) {
                    let _ = tokio::fs::remove_file(target_root.join(key)).await;
                    for extra in &leaf.extra_files {
                        let _ = tokio::fs::remove_file(target_root.join(extra)).await;
                    }
                    deleted += 1;
                    ctx.ring.info(&task_id, format!("Deleted stale strm: {key}"));
                }
            }
            if deleted > 0 {
                ctx.ring
                    .info(&task_id, format!("Removed {deleted} stale strm files"));
            }
        }
    }

    if task.sync_local_delete {
        sync_local_deletions(&ctx, &task, &client, &mut tree, &target_root).await;
    }

    ctx.cache.save_strm(&task_id, &tree).await?;

    let stats = TaskStats {
        total,
        success: counters.created.load(Ordering::Relaxed),
        skipped: counters.skipped.load(Ordering::Relaxed),
        skipped_filtered: 0,
        failed: counters.failed.load(Ordering::Relaxed),
        protection_tripped,
    };
    ctx.ring.info(
        &task_id,
        format!(
            "STRM run finished: total={} created={} skipped={} failed={}",
            stats.total, stats.success, stats.skipped, stats.failed
        ),
    );
    Ok(stats)
}

// ── Remote crawl ────────────────────────────────────────────────────────────

/// Depth-first crawl of the remote tree, one listing page at a time.
async fn crawl_remote(
    ctx: &StrmRunContext,
    task: &StrmTask,
    client: &OpenListClient,
) -> Result<(Vec<RemoteVideo>, Vec<RemoteExtra>)> {
    let videos_exts = ctx.settings.extensions.video_set();
    let subtitle_exts = ctx.settings.extensions.subtitle_set();
    let image_exts = ctx.settings.extensions.image_set();
    let nfo_exts = ctx.settings.extensions.nfo_set();

    let mut videos = Vec::new();
    let mut extras = Vec::new();
    let mut stack = vec![task.source_dir.clone()];
    let mut first_request = true;

    while let Some(dir) = stack.pop() {
        let mut page = 1u32;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            // Politeness pacing between successive directory requests.
            if !first_request && task.wait_time_secs > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(task.wait_time_secs)).await;
            }
            first_request = false;

            let (entries, total) = client
                .list(&dir, page, LIST_PAGE_SIZE)
                .await
                .map_err(AppError::from)?;
            let page_len = entries.len() as u64;

            for entry in entries {
                let full_path = join_remote(&dir, &entry.name);
                if entry.is_dir {
                    stack.push(full_path);
                    continue;
                }
                let ext = remote_extension(&entry.name);
                if videos_exts.contains(&ext) {
                    videos.push(RemoteVideo {
                        full_path,
                        size: entry.size,
                        sign: entry.sign,
                        raw_url: entry.raw_url,
                    });
                } else if (task.subtitle && subtitle_exts.contains(&ext))
                    || (task.image && image_exts.contains(&ext))
                    || (task.nfo && nfo_exts.contains(&ext))
                {
                    extras.push(RemoteExtra {
                        full_path,
                        sign: entry.sign,
                    });
                }
                // Everything else is ignored.
            }

            if page_len < u64::from(LIST_PAGE_SIZE)
                || u64::from(page) * u64::from(LIST_PAGE_SIZE) >= total
            {
                break;
            }
            page += 1;
        }
    }

    Ok((videos, extras))
}

/// Classify one FsEntry name into its lowercase dotless extension.
fn remote_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Relative path of a remote file under the task source dir, or None for
/// paths outside it. Flatten mode keeps only the file name, so the whole
/// tree lands in the target root.
fn rel_path(source_dir: &str, full_path: &str, flatten: bool) -> Option<String> {
    let root = source_dir.trim_end_matches('/');
    let rest = full_path.strip_prefix(root)?;
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        return None;
    }
    if flatten {
        return rest.rsplit('/').next().map(str::to_string);
    }
    Some(rest.to_string())
}

/// Local `.strm` path (relative to the target dir) for a remote video,
/// mirrored or flattened per the task.
fn strm_rel_path(source_dir: &str, full_path: &str, flatten: bool) -> Option<String> {
    let rel = rel_path(source_dir, full_path, flatten)?;
    let path = Path::new(&rel);
    let stem = path.file_stem()?.to_string_lossy();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let strm = parent.join(format!("{stem}.strm"));
    Some(strm.to_string_lossy().into_owned())
}

/// Key grouping a file with its same-stem siblings in one directory.
fn parent_and_stem(rel: &str) -> String {
    let path = Path::new(rel);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{parent}/{stem}")
}

/// `.strm` body for a video under the task's mode. Content is a single line,
/// no trailing newline.
fn strm_content(mode: StrmMode, client: &OpenListClient, video: &RemoteVideo) -> String {
    match mode {
        StrmMode::AlistUrl => client.download_url(&video.full_path, &video.sign),
        StrmMode::RawUrl => match &video.raw_url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => client.download_url(&video.full_path, &video.sign),
        },
        StrmMode::AlistPath => video.full_path.clone(),
    }
}

/// Pick one main stream per Blu-ray folder: for `…/BDMV/STREAM/*.m2ts`
/// groups, keep only the largest file, renamed after the movie root.
fn select_bdmv_mains(videos: Vec<RemoteVideo>) -> Vec<RemoteVideo> {
    let mut plain = Vec::new();
    let mut groups: BTreeMap<String, RemoteVideo> = BTreeMap::new();

    for video in videos {
        let is_bdmv = video.full_path.contains("/BDMV/STREAM/")
            && remote_extension(&video.full_path) == "m2ts";
        if !is_bdmv {
            plain.push(video);
            continue;
        }
        let movie_root = video
            .full_path
            .split("/BDMV/")
            .next()
            .unwrap_or(&video.full_path)
            .to_string();
        match groups.get(&movie_root) {
            Some(existing) if existing.size >= video.size => {}
            _ => {
                groups.insert(movie_root, video);
            }
        }
    }

    for (movie_root, mut main) in groups {
        let movie_name = movie_root.rsplit('/').next().unwrap_or("bdmv").to_string();
        main.full_path = format!("{movie_root}/{movie_name}.m2ts");
        plain.push(main);
    }
    plain
}

// ── Local writes ────────────────────────────────────────────────────────────

/// Write bytes via a sibling temp file and atomic rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!("{file_name}.tmp"));
    tokio::fs::write(&temp, bytes).await?;
    match tokio::fs::rename(&temp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp).await;
            Err(e)
        }
    }
}

/// Write unless the file already holds identical content. Returns whether a
/// write happened.
async fn write_if_changed(path: &Path, bytes: &[u8], force: bool) -> std::io::Result<bool> {
    if !force {
        if let Ok(existing) = tokio::fs::read(path).await {
            if existing == bytes {
                return Ok(false);
            }
        } else if tokio::fs::try_exists(path).await.unwrap_or(false) {
            // Unreadable but present: leave it alone rather than clobber.
            return Ok(false);
        }
    }
    write_atomic(path, bytes).await?;
    Ok(true)
}

// ── Anti-mass-delete ────────────────────────────────────────────────────────

struct ServerDeletePlan {
    delete_keys: Vec<String>,
    missing_count: usize,
    tripped: bool,
}

/// Update absence counters against this scan's observations and decide which
/// leaves are ripe for local deletion.
///
/// A scan whose missing set exceeds the threshold trips the protection: no
/// counter moves, no deletions. Otherwise observed leaves reset to zero and
/// missing leaves age by one; leaves absent for `grace_scans` consecutive
/// scans are returned for deletion.
fn plan_server_deletions(
    tree: &mut StrmTree,
    observed: &BTreeSet<String>,
    protection: &SmartProtection,
    scan: u64,
) -> ServerDeletePlan {
    let missing: Vec<String> = tree
        .leaves
        .keys()
        .filter(|k| !observed.contains(*k))
        .cloned()
        .collect();

    if missing.len() > protection.threshold {
        return ServerDeletePlan {
            delete_keys: Vec::new(),
            missing_count: missing.len(),
            tripped: true,
        };
    }

    let mut delete_keys = Vec::new();
    for (key, leaf) in tree.leaves.iter_mut() {
        if observed.contains(key) {
            leaf.miss_count = 0;
            leaf.last_seen_scan = scan;
        } else {
            leaf.miss_count += 1;
            if leaf.miss_count >= protection.grace_scans {
                delete_keys.push(key.clone());
            }
        }
    }

    ServerDeletePlan {
        missing_count: missing.len(),
        delete_keys,
        tripped: false,
    }
}

/// Propagate local deletions to the server: a leaf whose `.strm` vanished
/// locally requests remote removal, provided the suffix filter admits the
/// remote file. Leaf keys are the local paths the generation phase wrote
/// (flattened or mirrored per the task), and `remote_path` carries the
/// reverse mapping. The protection threshold also guards this direction.
async fn sync_local_deletions(
    ctx: &StrmRunContext,
    task: &StrmTask,
    client: &OpenListClient,
    tree: &mut StrmTree,
    target_root: &Path,
) {
    let mut to_remove: Vec<String> = Vec::new();
    for (key, leaf) in &tree.leaves {
        if leaf.remote_path.is_empty() {
            continue;
        }
        let ext = remote_extension(&leaf.remote_path);
        if !task.suffix_filter.admits(&ext) {
            continue;
        }
        // Probed by literal path; symlink targets are never resolved.
        let present = tokio::fs::try_exists(target_root.join(key))
            .await
            .unwrap_or(true);
        if !present {
            to_remove.push(key.clone());
        }
    }

    if to_remove.is_empty() {
        return;
    }
    if to_remove.len() > task.protection.threshold {
        ctx.ring.warn(
            &task.id,
            format!(
                "protection tripped: {} local deletions exceed threshold {}, remote deletion skipped",
                to_remove.len(),
                task.protection.threshold
            ),
        );
        return;
    }

    for key in to_remove {
        let Some(leaf) = tree.leaves.get(&key) else { continue };
        let remote = leaf.remote_path.clone();
        match client.remove(std::slice::from_ref(&remote)).await {
            Ok(()) => {
                ctx.ring
                    .info(&task.id, format!("Deleted on server: {remote}"));
                tree.leaves.remove(&key);
            }
            Err(e) => {
                ctx.ring
                    .warn(&task.id, format!("Server deletion failed for {remote}: {e}"));
            }
        }
    }
}

// ── Reconstruct ─────────────────────────────────────────────────────────────

/// Rebuild the cache tree from the `.strm` files already present under the
/// target directory. Remote paths cannot be recovered from a local scan and
/// are left empty.
async fn reconstruct(
    ctx: &StrmRunContext,
    task: &StrmTask,
    target_root: &Path,
    tree: &mut StrmTree,
) -> Result<TaskStats> {
    let root = target_root.to_path_buf();
    let found: Vec<String> = tokio::task::spawn_blocking(move || {
        WalkDir::new(&root)
            .into_iter()
            .flatten()
            .filter(|e| {
                e.file_type().is_file()
                    && e.path().extension().is_some_and(|ext| ext == "strm")
            })
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&root)
                    .ok()
                    .map(|p| p.to_string_lossy().into_owned())
            })
            .collect()
    })
    .await
    .map_err(|e| AppError::Internal(format!("reconstruct scan panicked: {e}")))?;

    for rel in &found {
        tree.leaves.insert(
            rel.clone(),
            StrmLeaf {
                remote_path: String::new(),
                extra_files: Vec::new(),
                last_seen_scan: tree.scan_count,
                miss_count: 0,
            },
        );
    }

    ctx.ring.info(
        &task.id,
        format!("Reconstructed {} strm cache leaves from target", found.len()),
    );
    Ok(TaskStats {
        total: found.len() as u64,
        success: 0,
        skipped: found.len() as u64,
        skipped_filtered: 0,
        failed: 0,
        protection_tripped: false,
    })
}

// ── Progress plumbing ───────────────────────────────────────────────────────

#[derive(Default)]
struct GenCounters {
    done: AtomicU64,
    created: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

fn spawn_progress_publisher(
    store: Arc<TaskStore>,
    task_id: String,
    counters: Arc<GenCounters>,
    total: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            publish_progress(&store, &task_id, &counters, total).await;
        }
    })
}

async fn publish_progress(store: &TaskStore, task_id: &str, counters: &GenCounters, total: u64) {
    let done = counters.done.load(Ordering::Relaxed);
    let progress = TaskProgress {
        done,
        total,
        success: counters.created.load(Ordering::Relaxed),
        skipped: counters.skipped.load(Ordering::Relaxed),
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
    use crate::models::{SuffixFilter, SuffixMode, TaskStatus};

    fn video(path: &str, size: u64) -> RemoteVideo {
        RemoteVideo {
            full_path: path.into(),
            size,
            sign: String::new(),
            raw_url: None,
        }
    }

    fn leaf(remote: &str) -> StrmLeaf {
        StrmLeaf {
            remote_path: remote.into(),
            extra_files: Vec::new(),
            last_seen_scan: 0,
            miss_count: 0,
        }
    }

    // ── Path helpers ────────────────────────────────────────────────────

    #[test]
    fn test_rel_path_strips_source_dir() {
        assert_eq!(
            rel_path("/media", "/media/movies/Avatar.mkv", false),
            Some("movies/Avatar.mkv".into())
        );
        assert_eq!(
            rel_path("/media/", "/media/a.mkv", false),
            Some("a.mkv".into())
        );
        assert_eq!(rel_path("/media", "/other/a.mkv", false), None);
    }

    #[test]
    fn test_rel_path_flatten_keeps_only_name() {
        assert_eq!(
            rel_path("/media", "/media/movies/2009/Avatar.mkv", true),
            Some("Avatar.mkv".into())
        );
        assert_eq!(rel_path("/media", "/media/a.srt", true), Some("a.srt".into()));
        assert_eq!(rel_path("/media", "/other/a.mkv", true), None);
    }

    #[test]
    fn test_strm_rel_path_swaps_extension() {
        assert_eq!(
            strm_rel_path("/media", "/media/movies/Avatar (2009).mkv", false),
            Some("movies/Avatar (2009).strm".into())
        );
        assert_eq!(
            strm_rel_path("/media", "/media/a.mkv", false),
            Some("a.strm".into())
        );
    }

    #[test]
    fn test_strm_rel_path_flatten_drops_directories() {
        assert_eq!(
            strm_rel_path("/media", "/media/movies/2009/Avatar.mkv", true),
            Some("Avatar.strm".into())
        );
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/media/", "a.mkv"), "/media/a.mkv");
        assert_eq!(join_remote("/media", "a.mkv"), "/media/a.mkv");
    }

    #[test]
    fn test_parent_and_stem_groups_siblings() {
        assert_eq!(
            parent_and_stem("movies/Avatar.strm"),
            parent_and_stem("movies/Avatar.srt")
        );
        assert_ne!(
            parent_and_stem("movies/Avatar.strm"),
            parent_and_stem("movies/Titanic.srt")
        );
    }

    // ── Content modes ───────────────────────────────────────────────────

    fn test_client() -> OpenListClient {
        let settings = crate::models::OpenListSettings {
            url: "http://openlist:5244".into(),
            public_url: "https://pub.example.com".into(),
            token: "jwt".into(),
            ..Default::default()
        };
        OpenListClient::new(OpenListConfig::from_settings(&settings, false)).unwrap()
    }

    #[test]
    fn test_strm_content_alist_url() {
        let client = test_client();
        let mut v = video("/media/a b.mkv", 1);
        v.sign = "s1".into();
        assert_eq!(
            strm_content(StrmMode::AlistUrl, &client, &v),
            "https://pub.example.com/d/media/a%20b.mkv?sign=s1"
        );
    }

    #[test]
    fn test_strm_content_raw_url_with_fallback() {
        let client = test_client();
        let mut v = video("/media/a.mkv", 1);
        v.raw_url = Some("https://cdn.example.com/raw/a.mkv".into());
        assert_eq!(
            strm_content(StrmMode::RawUrl, &client, &v),
            "https://cdn.example.com/raw/a.mkv"
        );
        v.raw_url = None;
        assert!(strm_content(StrmMode::RawUrl, &client, &v).contains("/d/media/a.mkv"));
    }

    #[test]
    fn test_strm_content_alist_path() {
        let client = test_client();
        let v = video("/media/a.mkv", 1);
        assert_eq!(strm_content(StrmMode::AlistPath, &client, &v), "/media/a.mkv");
    }

    // ── BDMV ────────────────────────────────────────────────────────────

    #[test]
    fn test_bdmv_selects_largest_per_movie() {
        let videos = vec![
            video("/m/Avatar/BDMV/STREAM/00001.m2ts", 100),
            video("/m/Avatar/BDMV/STREAM/00002.m2ts", 900),
            video("/m/Avatar/BDMV/STREAM/00003.m2ts", 50),
            video("/m/Clip.mkv", 10),
        ];
        let selected = select_bdmv_mains(videos);
        assert_eq!(selected.len(), 2);
        let bdmv = selected
            .iter()
            .find(|v| v.full_path.ends_with(".m2ts"))
            .unwrap();
        assert_eq!(bdmv.full_path, "/m/Avatar/Avatar.m2ts");
        assert_eq!(bdmv.size, 900);
    }

    #[test]
    fn test_bdmv_passthrough_without_bdmv_files() {
        let videos = vec![video("/m/a.mkv", 1), video("/m/b.ts", 2)];
        assert_eq!(select_bdmv_mains(videos).len(), 2);
    }

    // ── Anti-mass-delete ────────────────────────────────────────────────

    fn protection(threshold: usize, grace: u32) -> SmartProtection {
        SmartProtection {
            threshold,
            grace_scans: grace,
        }
    }

    #[test]
    fn test_missing_leaves_age_then_delete() {
        let mut tree = StrmTree::default();
        tree.leaves.insert("a.strm".into(), leaf("/m/a.mkv"));
        let observed = BTreeSet::new();
        let prot = protection(10, 3);

        for scan in 1..=2 {
            let plan = plan_server_deletions(&mut tree, &observed, &prot, scan);
            assert!(!plan.tripped);
            assert!(plan.delete_keys.is_empty());
        }
        assert_eq!(tree.leaves["a.strm"].miss_count, 2);

        let plan = plan_server_deletions(&mut tree, &observed, &prot, 3);
        assert_eq!(plan.delete_keys, vec!["a.strm".to_string()]);
    }

    #[test]
    fn test_reobservation_resets_miss_count() {
        let mut tree = StrmTree::default();
        let mut l = leaf("/m/a.mkv");
        l.miss_count = 2;
        tree.leaves.insert("a.strm".into(), l);

        let observed: BTreeSet<String> = ["a.strm".to_string()].into();
        let plan = plan_server_deletions(&mut tree, &observed, &protection(10, 3), 5);
        assert!(plan.delete_keys.is_empty());
        assert_eq!(tree.leaves["a.strm"].miss_count, 0);
        assert_eq!(tree.leaves["a.strm"].last_seen_scan, 5);
    }

    #[test]
    fn test_mass_delete_trips_protection_without_mutation() {
        let mut tree = StrmTree::default();
        for i in 0..500 {
            tree.leaves.insert(format!("f{i}.strm"), leaf("/m/x.mkv"));
        }
        let observed = BTreeSet::new();

        let plan = plan_server_deletions(&mut tree, &observed, &protection(100, 3), 1);
        assert!(plan.tripped);
        assert_eq!(plan.missing_count, 500);
        assert!(plan.delete_keys.is_empty());
        // No counter moved, no leaf pruned.
        assert_eq!(tree.leaves.len(), 500);
        assert!(tree.leaves.values().all(|l| l.miss_count == 0));
    }

    #[test]
    fn test_exactly_threshold_missing_is_not_a_trip() {
        let mut tree = StrmTree::default();
        for i in 0..100 {
            tree.leaves.insert(format!("f{i}.strm"), leaf("/m/x.mkv"));
        }
        let plan = plan_server_deletions(&mut tree, &BTreeSet::new(), &protection(100, 1), 1);
        assert!(!plan.tripped);
        assert_eq!(plan.delete_keys.len(), 100);
    }

    // ── Local writes ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_write_if_changed_skips_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.strm");
        assert!(write_if_changed(&path, b"http://x/a", false).await.unwrap());
        assert!(!write_if_changed(&path, b"http://x/a", false).await.unwrap());
        assert!(write_if_changed(&path, b"http://x/b", false).await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"http://x/b");
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/a.strm");
        write_atomic(&path, b"content").await.unwrap();
        assert!(path.exists());
        assert!(!path.with_file_name("a.strm.tmp").exists());
    }

    // ── Reconstruct ─────────────────────────────────────────────────────

    fn strm_task(target: &Path) -> StrmTask {
        StrmTask {
            id: "s1".into(),
            name: "s1".into(),
            source_dir: "/media".into(),
            target_dir: target.to_string_lossy().into_owned(),
            cron: "0 3 * * *".into(),
            mode: StrmMode::AlistUrl,
            subtitle: false,
            image: false,
            nfo: false,
            flatten_mode: false,
            max_workers: 2,
            wait_time_secs: 0,
            sync_server_delete: true,
            sync_local_delete: false,
            suffix_filter: SuffixFilter {
                mode: SuffixMode::None,
                list: vec![],
            },
            protection: SmartProtection::default(),
            enabled: true,
            last_run: None,
            status: TaskStatus::Idle,
            stats: Default::default(),
            progress: Default::default(),
            next_run: None,
        }
    }

    #[tokio::test]
    async fn test_reconstruct_rebuilds_leaves_from_target() {
        let config = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(target.path().join("movies")).unwrap();
        std::fs::write(target.path().join("movies/Avatar.strm"), b"url").unwrap();
        std::fs::write(target.path().join("movies/notes.txt"), b"x").unwrap();

        let store = Arc::new(
            TaskStore::load(config.path().join("tasks.json"))
                .await
                .unwrap(),
        );
        let cache = Arc::new(CacheStore::new(config.path().join("cache")));
        let ctx = StrmRunContext {
            task: strm_task(target.path()),
            kind: RunKind::Reconstruct,
            settings: Settings::default(),
            cancel: CancellationToken::new(),
            ring: Arc::new(LogRing::new()),
            store,
            cache: cache.clone(),
        };

        let stats = run(ctx).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.skipped, 1);

        let tree = cache.load_strm("s1").await.unwrap();
        assert!(tree.leaves.contains_key("movies/Avatar.strm"));
        assert!(tree.leaves["movies/Avatar.strm"].remote_path.is_empty());
    }
}
