//! Application configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

/// Read an environment variable and parse it, falling back to a default on missing or invalid values.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (host:port)
    pub bind_address: String,

    /// Directory holding tasks.json, settings.json and cache/
    pub config_dir: PathBuf,

    /// Directory for the rotated file log
    pub log_dir: PathBuf,

    /// File log level
    pub log_level: String,

    /// Console log level (defaults to warn so task chatter stays in the file log)
    pub console_level: String,

    /// Days of rotated log files to retain
    pub log_save_days: u32,

    /// Running inside a container
    pub is_docker: bool,

    /// Seconds a file's size must stay unchanged before it is copied
    pub stability_delay_secs: u64,

    /// Global concurrent-run cap; defaults to the number of CPU cores
    pub max_concurrent_runs: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let is_docker = matches!(env::var("IS_DOCKER").as_deref(), Ok("true" | "1"));
        let default_config_dir = if is_docker { "/app/config" } else { "config" };

        let default_cap = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3602".into()),
            config_dir: env::var("CONFIG_DIR")
                .unwrap_or_else(|_| default_config_dir.into())
                .into(),
            log_dir: env::var("LOG_DIR").unwrap_or_else(|_| "logs".into()).into(),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            console_level: env::var("CONSOLE_LEVEL").unwrap_or_else(|_| "warn".into()),
            log_save_days: env_parse("LOG_SAVE_DAYS", 7),
            is_docker,
            stability_delay_secs: env_parse("STABILITY_DELAY", 5),
            max_concurrent_runs: env_parse("MAX_CONCURRENT_RUNS", default_cap).max(1),
        }
    }

    /// Path of the serialized task list.
    pub fn tasks_path(&self) -> PathBuf {
        self.config_dir.join("tasks.json")
    }

    /// Path of the global settings document.
    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    /// Directory holding per-task cache trees.
    pub fn cache_dir(&self) -> PathBuf {
        self.config_dir.join("cache")
    }
}
