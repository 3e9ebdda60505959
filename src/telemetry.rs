//! Telemetry initialization: tracing subscriber with console and file outputs.
//!
//! The console layer defaults to `warn` so scheduled-run chatter stays out of
//! interactive sessions; the file layer writes a daily-rotated
//! `logs/cloudgather.log` honoring `LOG_LEVEL`. Rotated files older than
//! `LOG_SAVE_DAYS` are removed at startup.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::Config;

/// Initialize the tracing subscriber.
///
/// Returns a guard that must be held for the lifetime of the application so
/// buffered file output is flushed on shutdown.
pub fn init_tracing(config: &Config) -> WorkerGuard {
    std::fs::create_dir_all(&config.log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "cloudgather.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(parse_level(&config.log_level, LevelFilter::INFO));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_filter(parse_level(&config.console_level, LevelFilter::WARN));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}

/// Parse a level name, falling back to the given default on unknown values.
fn parse_level(level: &str, default: LevelFilter) -> LevelFilter {
    level.parse().unwrap_or(default)
}

/// Remove rotated log files older than the retention window.
pub fn cleanup_old_logs(log_dir: &Path, save_days: u32) {
    let cutoff = SystemTime::now() - Duration::from_secs(u64::from(save_days) * 86_400);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let mut removed = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("cloudgather.log") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else { continue };
        if modified < cutoff && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::info!(removed, "Removed expired log files");
    }
}
