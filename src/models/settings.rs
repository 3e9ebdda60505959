//! Global settings: OpenList connection, extension classes, retry count.
//!
//! Persisted as one `settings.json` document. The OpenList password is kept
//! base64-encoded at rest so it can be replayed to the server on login; it is
//! never returned through the API.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// OpenList server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OpenListSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    /// Base64-encoded password blob; empty when token auth is used.
    #[serde(default)]
    pub password_b64: String,
    /// Pre-issued bearer token; takes precedence over username/password.
    #[serde(default)]
    pub token: String,
    /// Public base URL used when building .strm links, if it differs from `url`.
    #[serde(default)]
    pub public_url: String,
}

impl OpenListSettings {
    pub fn set_password(&mut self, password: &str) {
        self.password_b64 = if password.is_empty() {
            String::new()
        } else {
            base64::engine::general_purpose::STANDARD.encode(password)
        };
    }

    /// Decode the stored password; an undecodable blob is treated as unset.
    pub fn password(&self) -> String {
        if self.password_b64.is_empty() {
            return String::new();
        }
        base64::engine::general_purpose::STANDARD
            .decode(&self.password_b64)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default()
    }

    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
            && (!self.token.is_empty() || (!self.username.is_empty() && !self.password_b64.is_empty()))
    }
}

/// File-extension classes used by the STRM worker to classify remote entries.
///
/// Stored as comma-separated lists with leading dots, matching what the
/// settings UI edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionSettings {
    pub video: String,
    pub subtitle: String,
    pub image: String,
    pub nfo: String,
    #[serde(default)]
    pub other: String,
}

impl Default for ExtensionSettings {
    fn default() -> Self {
        Self {
            video: ".mp4,.mkv,.avi,.mov,.flv,.wmv,.mpeg,.mpg,.m4v,.ts,.rmvb,.webm,.m2ts".into(),
            subtitle: ".srt,.ass,.ssa,.sub,.vtt".into(),
            image: ".jpg,.jpeg,.png,.bmp,.gif,.webp".into(),
            nfo: ".nfo".into(),
            other: String::new(),
        }
    }
}

impl ExtensionSettings {
    /// Parse one class into a set of lowercase extensions without the dot.
    pub fn parse_class(class: &str) -> HashSet<String> {
        class
            .split(',')
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }

    pub fn video_set(&self) -> HashSet<String> {
        Self::parse_class(&self.video)
    }

    pub fn subtitle_set(&self) -> HashSet<String> {
        Self::parse_class(&self.subtitle)
    }

    pub fn image_set(&self) -> HashSet<String> {
        Self::parse_class(&self.image)
    }

    pub fn nfo_set(&self) -> HashSet<String> {
        Self::parse_class(&self.nfo)
    }

    /// Validate that every non-empty entry starts with a dot, mirroring what
    /// the settings endpoint enforces.
    pub fn validate(&self) -> Result<(), String> {
        for (name, class) in [
            ("video", &self.video),
            ("subtitle", &self.subtitle),
            ("image", &self.image),
            ("nfo", &self.nfo),
        ] {
            for ext in class.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                if !ext.starts_with('.') {
                    return Err(format!(
                        "extension '{}' in class '{}' must start with a dot",
                        ext, name
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Whole settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub openlist: OpenListSettings,
    #[serde(default)]
    pub extensions: ExtensionSettings,
    #[serde(default = "default_retry_count")]
    pub sync_retry_count: u32,
}

fn default_retry_count() -> u32 {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openlist: OpenListSettings::default(),
            extensions: ExtensionSettings::default(),
            sync_retry_count: default_retry_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_round_trip() {
        let mut settings = OpenListSettings::default();
        settings.set_password("hunter2");
        assert_ne!(settings.password_b64, "hunter2");
        assert_eq!(settings.password(), "hunter2");
    }

    #[test]
    fn test_empty_password_stays_empty() {
        let mut settings = OpenListSettings::default();
        settings.set_password("");
        assert_eq!(settings.password_b64, "");
        assert_eq!(settings.password(), "");
    }

    #[test]
    fn test_is_configured_requires_credentials() {
        let mut settings = OpenListSettings {
            url: "http://openlist:5244".into(),
            ..Default::default()
        };
        assert!(!settings.is_configured());
        settings.token = "jwt".into();
        assert!(settings.is_configured());
    }

    #[test]
    fn test_parse_class_normalizes() {
        let set = ExtensionSettings::parse_class(".SRT, .Ass ,vtt,,");
        assert!(set.contains("srt"));
        assert!(set.contains("ass"));
        assert!(set.contains("vtt"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_default_video_class_covers_common_formats() {
        let videos = ExtensionSettings::default().video_set();
        for ext in ["mp4", "mkv", "ts", "m2ts"] {
            assert!(videos.contains(ext), "missing {ext}");
        }
    }

    #[test]
    fn test_validate_rejects_dotless_entries() {
        let mut extensions = ExtensionSettings::default();
        extensions.subtitle = "srt".into();
        assert!(extensions.validate().is_err());
        extensions.subtitle = ".srt".into();
        assert!(extensions.validate().is_ok());
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.sync_retry_count, 3);
        let parsed: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.sync_retry_count, 3);
    }
}
