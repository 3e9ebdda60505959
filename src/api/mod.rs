//! API module - HTTP handlers for the control surface.

pub mod dto;
pub mod handlers;
pub mod routes;

use std::sync::Arc;

use crate::config::Config;
use crate::services::cache_store::CacheStore;
use crate::services::log_ring::LogRing;
use crate::services::scheduler::Scheduler;
use crate::services::settings_store::SettingsStore;
use crate::services::task_store::TaskStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub tasks: Arc<TaskStore>,
    pub settings: Arc<SettingsStore>,
    pub cache: Arc<CacheStore>,
    pub ring: Arc<LogRing>,
    pub scheduler: Arc<Scheduler>,
}

pub type SharedState = Arc<AppState>;
