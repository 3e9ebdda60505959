//! Per-task cache tree persistence (`cache/<task-id>.json`).
//!
//! Cache trees are owned by the running worker of their task, so there is no
//! cross-task locking here; files are written atomically after each run.

use std::path::PathBuf;

use crate::error::Result;
use crate::models::{StrmTree, SyncTree};

pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    pub async fn load_sync(&self, task_id: &str) -> Result<SyncTree> {
        self.load(task_id).await
    }

    pub async fn save_sync(&self, task_id: &str, tree: &SyncTree) -> Result<()> {
        super::write_json_atomic(&self.path_for(task_id), tree).await
    }

    pub async fn load_strm(&self, task_id: &str) -> Result<StrmTree> {
        self.load(task_id).await
    }

    pub async fn save_strm(&self, task_id: &str, tree: &StrmTree) -> Result<()> {
        super::write_json_atomic(&self.path_for(task_id), tree).await
    }

    /// Drop the cache of a deleted task.
    pub async fn remove(&self, task_id: &str) {
        let _ = tokio::fs::remove_file(self.path_for(task_id)).await;
    }

    async fn load<T: serde::de::DeserializeOwned + Default>(&self, task_id: &str) -> Result<T> {
        match tokio::fs::read(self.path_for(task_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StrmLeaf, SyncCacheEntry, SyncEntryStatus};

    #[tokio::test]
    async fn test_missing_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_path_buf());
        let tree = store.load_sync("nope").await.unwrap();
        assert!(tree.entries.is_empty());
    }

    #[tokio::test]
    async fn test_sync_tree_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache"));
        let mut tree = SyncTree::default();
        tree.entries.insert(
            "a.mkv".into(),
            SyncCacheEntry {
                size: 10,
                mtime: 100,
                status: SyncEntryStatus::Synced,
                last_sync: None,
                file_create: None,
            },
        );
        store.save_sync("t1", &tree).await.unwrap();
        let back = store.load_sync("t1").await.unwrap();
        assert_eq!(back.entries, tree.entries);
    }

    #[tokio::test]
    async fn test_strm_tree_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache"));
        let mut tree = StrmTree {
            root: "/media".into(),
            scan_count: 2,
            ..Default::default()
        };
        tree.leaves.insert(
            "a.strm".into(),
            StrmLeaf {
                remote_path: "/media/a.mkv".into(),
                extra_files: vec![],
                last_seen_scan: 2,
                miss_count: 0,
            },
        );
        store.save_strm("t2", &tree).await.unwrap();
        assert_eq!(store.load_strm("t2").await.unwrap().scan_count, 2);

        store.remove("t2").await;
        assert_eq!(store.load_strm("t2").await.unwrap().scan_count, 0);
    }
}
