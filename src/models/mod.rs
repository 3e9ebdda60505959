//! Data models shared across services and the API layer.

pub mod cache;
pub mod settings;
pub mod task;

pub use cache::{StrmLeaf, StrmTree, SyncCacheEntry, SyncEntryStatus, SyncTree};
pub use settings::{ExtensionSettings, OpenListSettings, Settings};
pub use task::{
    DeletePolicy, DeleteTimeBase, RunKind, SizeFilter, SmartProtection, StrmMode, StrmTask,
    SuffixFilter, SuffixMode, SyncTask, Task, TaskProgress, TaskStats, TaskStatus,
};
