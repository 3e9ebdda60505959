//! Persistent global settings store (`settings.json`).

use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::Settings;

pub struct SettingsStore {
    path: PathBuf,
    settings: RwLock<Settings>,
}

impl SettingsStore {
    /// Load settings; a missing file yields defaults.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let settings = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            settings: RwLock::new(settings),
        })
    }

    pub async fn get(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Apply a mutation and persist the whole document.
    pub async fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let mut settings = self.settings.write().await;
        f(&mut settings);
        super::write_json_atomic(&self.path, &*settings).await?;
        Ok(settings.clone())
    }
}
