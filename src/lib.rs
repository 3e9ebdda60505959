//! CloudGather - Backend Library
//!
//! Scheduled mirroring service: cron-driven directory sync between local
//! filesystems and cloud-mounted storage, plus STRM generation against an
//! OpenList-compatible API.

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
