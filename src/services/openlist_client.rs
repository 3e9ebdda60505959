//! OpenList (AList-compatible) API client.
//!
//! Wraps the list/fs endpoints used by the STRM engine: token login, paged
//! directory listings, file info, download, and remote deletion. Idempotent
//! reads retry with exponential backoff; writes are attempted at most twice
//! and surface any failure. A 401 triggers one transparent re-login before
//! giving up with an auth error.

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::models::OpenListSettings;

/// Errors surfaced by the OpenList client.
#[derive(Error, Debug)]
pub enum OpenListError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("API error: {code} - {message}")]
    Api { code: i64, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl From<OpenListError> for AppError {
    fn from(e: OpenListError) -> Self {
        match e {
            OpenListError::Auth(msg) => AppError::Auth(msg),
            other => AppError::Remote(other.to_string()),
        }
    }
}

/// Retry configuration for idempotent reads.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct OpenListConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Pre-issued token; used as-is when set.
    pub token: Option<String>,
    /// Public base for user-facing download links.
    pub public_url: Option<String>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl OpenListConfig {
    /// Build a client config from the persisted settings. Slow-storage task
    /// context widens the read timeout from 60s to 180s.
    pub fn from_settings(settings: &OpenListSettings, slow_storage: bool) -> Self {
        Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password(),
            token: if settings.token.is_empty() {
                None
            } else {
                Some(settings.token.clone())
            },
            public_url: if settings.public_url.is_empty() {
                None
            } else {
                Some(settings.public_url.trim_end_matches('/').to_string())
            },
            connect_timeout_secs: 10,
            read_timeout_secs: if slow_storage { 180 } else { 60 },
            retry: RetryConfig::default(),
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────────────

/// Standard OpenList response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct FsEntry {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub modified: String,
    #[serde(default)]
    pub sign: String,
    #[serde(default)]
    pub raw_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(default)]
    content: Option<Vec<FsEntry>>,
    #[serde(default)]
    total: u64,
}

// ── Client ──────────────────────────────────────────────────────────────────

pub struct OpenListClient {
    http: Client,
    config: OpenListConfig,
    token: RwLock<Option<String>>,
}

/// Characters percent-encoded inside download paths; `/` is kept as the
/// segment separator.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b'+');

fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

/// Hex sha256 of a password, for the `/api/auth/login/hash` endpoint.
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl OpenListClient {
    pub fn new(config: OpenListConfig) -> Result<Self, OpenListError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .build()?;
        let token = config.token.clone();
        Ok(Self {
            http,
            config,
            token: RwLock::new(token),
        })
    }

    // ── Auth ────────────────────────────────────────────────────────────

    /// Log in with username/password, caching and returning the token.
    pub async fn login(&self) -> Result<String, OpenListError> {
        self.do_login(json!({
            "username": self.config.username,
            "password": self.config.password,
        }))
        .await
    }

    /// Log in with a pre-hashed (sha256 hex) password.
    pub async fn login_hashed(
        &self,
        username: &str,
        sha256_password: &str,
    ) -> Result<String, OpenListError> {
        self.do_login_at(
            "/api/auth/login/hash",
            json!({
                "username": username,
                "password": sha256_password,
            }),
        )
        .await
    }

    async fn do_login(&self, body: serde_json::Value) -> Result<String, OpenListError> {
        self.do_login_at("/api/auth/login", body).await
    }

    async fn do_login_at(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<String, OpenListError> {
        let url = format!("{}{}", self.config.base_url, endpoint);
        let response = self.http.post(&url).json(&body).send().await?;
        let envelope: Envelope<LoginData> = response.json().await?;

        if envelope.code != 200 {
            return Err(OpenListError::Auth(envelope.message));
        }
        let token = envelope
            .data
            .map(|d| d.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OpenListError::Auth("login returned no token".into()))?;

        *self.token.write().await = Some(token.clone());
        tracing::info!(url = %self.config.base_url, "OpenList login succeeded");
        Ok(token)
    }

    async fn ensure_token(&self) -> Result<String, OpenListError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        if self.config.username.is_empty() {
            return Err(OpenListError::Auth("no token and no credentials".into()));
        }
        self.login().await
    }

    // ── Core request plumbing ───────────────────────────────────────────

    /// POST an authenticated fs-API request, parsing the envelope.
    ///
    /// `max_attempts` covers transient transport/5xx failures; an auth
    /// failure additionally gets exactly one re-login retry.
    async fn fs_post<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
        max_attempts: u32,
    ) -> Result<T, OpenListError> {
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        let mut delay_ms = retry.initial_delay_ms;
        let mut auth_retried = false;

        loop {
            let token = self.ensure_token().await?;
            let url = format!("{}{}", self.config.base_url, endpoint);
            let result = self
                .http
                .post(&url)
                .header("Authorization", format!("Bearer {token}"))
                .json(&body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();

                    if status.as_u16() == 401 {
                        if !auth_retried {
                            auth_retried = true;
                            *self.token.write().await = None;
                            tracing::warn!("OpenList token rejected, re-logging in");
                            continue;
                        }
                        return Err(OpenListError::Auth("token rejected twice".into()));
                    }

                    if status.is_server_error() && attempt + 1 < max_attempts {
                        tracing::warn!(
                            "OpenList server error {}, retrying in {}ms (attempt {}/{})",
                            status,
                            delay_ms,
                            attempt + 1,
                            max_attempts
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                        delay_ms = next_delay(delay_ms, retry);
                        continue;
                    }

                    let envelope: Envelope<T> = response.json().await?;
                    return match envelope.code {
                        200 => envelope.data.ok_or_else(|| OpenListError::Api {
                            code: 200,
                            message: "missing data".into(),
                        }),
                        401 => {
                            if !auth_retried {
                                auth_retried = true;
                                *self.token.write().await = None;
                                continue;
                            }
                            Err(OpenListError::Auth(envelope.message))
                        }
                        404 => Err(OpenListError::NotFound(envelope.message)),
                        code => Err(OpenListError::Api {
                            code,
                            message: envelope.message,
                        }),
                    };
                }
                Err(e) => {
                    if (e.is_connect() || e.is_timeout()) && attempt + 1 < max_attempts {
                        tracing::warn!(
                            "OpenList network error: {}, retrying in {}ms (attempt {}/{})",
                            e,
                            delay_ms,
                            attempt + 1,
                            max_attempts
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                        delay_ms = next_delay(delay_ms, retry);
                        continue;
                    }
                    return Err(OpenListError::Http(e));
                }
            }
        }
    }

    // ── API methods ─────────────────────────────────────────────────────

    /// List one page of a directory. Callers iterate until the returned page
    /// is short.
    pub async fn list(
        &self,
        path: &str,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<FsEntry>, u64), OpenListError> {
        let data: ListData = self
            .fs_post(
                "/api/fs/list",
                json!({
                    "path": path,
                    "page": page,
                    "per_page": per_page,
                    "refresh": false,
                }),
                1 + self.config.retry.max_retries,
            )
            .await?;
        Ok((data.content.unwrap_or_default(), data.total))
    }

    /// Fetch a single entry's info.
    pub async fn get(&self, path: &str) -> Result<FsEntry, OpenListError> {
        self.fs_post(
            "/api/fs/get",
            json!({ "path": path }),
            1 + self.config.retry.max_retries,
        )
        .await
    }

    /// Remove remote paths. Writes are attempted at most twice.
    pub async fn remove(&self, paths: &[String]) -> Result<(), OpenListError> {
        if paths.is_empty() {
            return Ok(());
        }
        let _: serde_json::Value = self
            .fs_post("/api/fs/remove", json!({ "paths": paths }), 2)
            .await?;
        Ok(())
    }

    /// Probe the connection: verify the token (logging in if needed) and
    /// list the root directory.
    pub async fn test_connection(&self) -> Result<(), OpenListError> {
        self.ensure_token().await?;
        self.list("/", 1, 1).await.map(|_| ())
    }

    /// User-facing download URL for a signed path, preferring the public base.
    pub fn download_url(&self, full_path: &str, sign: &str) -> String {
        let base = self
            .config
            .public_url
            .as_deref()
            .unwrap_or(&self.config.base_url);
        let mut url = format!("{}/d/{}", base, encode_path(full_path.trim_start_matches('/')));
        if !sign.is_empty() {
            url.push_str("?sign=");
            url.push_str(sign);
        }
        url
    }

    /// Download a remote file's bytes through the internal base URL.
    ///
    /// Same auth contract as the fs-API calls: a 401 clears the cached token
    /// and re-logs-in exactly once before surfacing an auth error.
    pub async fn download(&self, full_path: &str, sign: &str) -> Result<Bytes, OpenListError> {
        let mut url = format!(
            "{}/d/{}",
            self.config.base_url,
            encode_path(full_path.trim_start_matches('/'))
        );
        if !sign.is_empty() {
            url.push_str("?sign=");
            url.push_str(sign);
        }

        let retry = &self.config.retry;
        let mut attempt = 0u32;
        let mut delay_ms = retry.initial_delay_ms;
        let mut auth_retried = false;

        loop {
            let token = self.ensure_token().await?;
            let result = self
                .http
                .get(&url)
                .header("Authorization", format!("Bearer {token}"))
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.bytes().await?);
                }
                Ok(response) if response.status().as_u16() == 401 => {
                    if !auth_retried {
                        auth_retried = true;
                        *self.token.write().await = None;
                        tracing::warn!("OpenList token rejected during download, re-logging in");
                        continue;
                    }
                    return Err(OpenListError::Auth("token rejected twice".into()));
                }
                Ok(response) if response.status().as_u16() == 404 => {
                    return Err(OpenListError::NotFound(full_path.to_string()));
                }
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() && attempt < retry.max_retries {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                        delay_ms = next_delay(delay_ms, retry);
                        continue;
                    }
                    return Err(OpenListError::Api {
                        code: i64::from(status.as_u16()),
                        message: format!("download failed for {full_path}"),
                    });
                }
                Err(e) => {
                    if (e.is_connect() || e.is_timeout()) && attempt < retry.max_retries {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                        delay_ms = next_delay(delay_ms, retry);
                        continue;
                    }
                    return Err(OpenListError::Http(e));
                }
            }
        }
    }
}

fn next_delay(delay_ms: u64, retry: &RetryConfig) -> u64 {
    std::cmp::min(
        (delay_ms as f64 * retry.backoff_multiplier) as u64,
        retry.max_delay_ms,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OpenListSettings;

    fn client_with(settings: OpenListSettings) -> OpenListClient {
        OpenListClient::new(OpenListConfig::from_settings(&settings, false)).unwrap()
    }

    #[test]
    fn test_retry_config_default() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.initial_delay_ms, 1000);
        assert_eq!(retry.max_delay_ms, 30000);
        assert_eq!(retry.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_next_delay_doubles_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(next_delay(1000, &retry), 2000);
        assert_eq!(next_delay(20000, &retry), 30000);
    }

    #[test]
    fn test_from_settings_trims_and_widens_timeouts() {
        let settings = OpenListSettings {
            url: "http://openlist:5244/".into(),
            public_url: "https://media.example.com/".into(),
            ..Default::default()
        };
        let config = OpenListConfig::from_settings(&settings, false);
        assert_eq!(config.base_url, "http://openlist:5244");
        assert_eq!(config.public_url.as_deref(), Some("https://media.example.com"));
        assert_eq!(config.read_timeout_secs, 60);

        let slow = OpenListConfig::from_settings(&settings, true);
        assert_eq!(slow.read_timeout_secs, 180);
    }

    #[test]
    fn test_download_url_uses_public_base_and_sign() {
        let client = client_with(OpenListSettings {
            url: "http://openlist:5244".into(),
            public_url: "https://media.example.com".into(),
            token: "jwt".into(),
            ..Default::default()
        });
        let url = client.download_url("/media/movies/Avatar (2009).mkv", "sig123");
        assert_eq!(
            url,
            "https://media.example.com/d/media/movies/Avatar%20(2009).mkv?sign=sig123"
        );
    }

    #[test]
    fn test_download_url_without_sign_or_public_base() {
        let client = client_with(OpenListSettings {
            url: "http://openlist:5244".into(),
            token: "jwt".into(),
            ..Default::default()
        });
        let url = client.download_url("/media/a.mkv", "");
        assert_eq!(url, "http://openlist:5244/d/media/a.mkv");
    }

    #[test]
    fn test_encode_path_keeps_separators() {
        assert_eq!(encode_path("a/b c/d#e"), "a/b%20c/d%23e");
        assert_eq!(encode_path("tv/S01E01 50%.mkv"), "tv/S01E01%2050%25.mkv");
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_envelope_deserialization() {
        let json = r#"{
            "code": 200,
            "message": "success",
            "data": {
                "content": [
                    {"name": "Avatar.mkv", "size": 1024, "is_dir": false, "sign": "s1"},
                    {"name": "Extras", "is_dir": true}
                ],
                "total": 2
            }
        }"#;
        let envelope: Envelope<ListData> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.code, 200);
        let data = envelope.data.unwrap();
        assert_eq!(data.total, 2);
        let content = data.content.unwrap();
        assert_eq!(content[0].name, "Avatar.mkv");
        assert_eq!(content[0].size, 1024);
        assert!(content[1].is_dir);
        assert_eq!(content[1].size, 0);
    }

    #[test]
    fn test_envelope_error_shape() {
        let json = r#"{"code": 401, "message": "token is invalid"}"#;
        let envelope: Envelope<ListData> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.code, 401);
        assert!(envelope.data.is_none());
    }

    #[test]
    fn test_auth_error_maps_to_app_auth() {
        let app: AppError = OpenListError::Auth("bad".into()).into();
        assert!(matches!(app, AppError::Auth(_)));
        let app: AppError = OpenListError::NotFound("x".into()).into();
        assert!(matches!(app, AppError::Remote(_)));
    }

    // ── 401 re-login during downloads ───────────────────────────────────

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct ServerHits {
        downloads: AtomicU32,
        logins: AtomicU32,
    }

    /// Minimal OpenList stand-in: a login endpoint issuing fresh tokens and
    /// a download route that rejects the first `reject_first` requests with
    /// a 401.
    async fn spawn_stub_server(reject_first: u32) -> (String, Arc<ServerHits>) {
        use axum::extract::State;
        use axum::http::StatusCode;
        use axum::routing::{get, post};
        use axum::{Json, Router};

        #[derive(Clone)]
        struct StubState {
            hits: Arc<ServerHits>,
            reject_first: u32,
        }

        async fn login(State(state): State<StubState>) -> Json<serde_json::Value> {
            state.hits.logins.fetch_add(1, Ordering::SeqCst);
            Json(serde_json::json!({
                "code": 200,
                "message": "success",
                "data": { "token": "fresh-token" }
            }))
        }

        async fn download(State(state): State<StubState>) -> (StatusCode, &'static str) {
            let n = state.hits.downloads.fetch_add(1, Ordering::SeqCst);
            if n < state.reject_first {
                (StatusCode::UNAUTHORIZED, "token expired")
            } else {
                (StatusCode::OK, "DATA")
            }
        }

        let hits = Arc::new(ServerHits::default());
        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/d/*path", get(download))
            .with_state(StubState {
                hits: hits.clone(),
                reject_first,
            });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), hits)
    }

    fn stub_client(base: String) -> OpenListClient {
        let mut settings = OpenListSettings {
            url: base,
            username: "admin".into(),
            token: "stale-token".into(),
            ..Default::default()
        };
        settings.set_password("pw");
        OpenListClient::new(OpenListConfig::from_settings(&settings, false)).unwrap()
    }

    #[tokio::test]
    async fn test_download_relogs_in_once_on_401() {
        let (base, hits) = spawn_stub_server(1).await;
        let client = stub_client(base);

        let bytes = client.download("/media/a.mkv", "").await.unwrap();
        assert_eq!(&bytes[..], b"DATA");
        assert_eq!(hits.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(hits.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_download_repeated_401_surfaces_auth_error() {
        let (base, hits) = spawn_stub_server(u32::MAX).await;
        let client = stub_client(base);

        let err = client.download("/media/a.mkv", "").await.unwrap_err();
        assert!(matches!(err, OpenListError::Auth(_)));
        // One transparent re-login, then the failure surfaces.
        assert_eq!(hits.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(hits.logins.load(Ordering::SeqCst), 1);
    }
}
