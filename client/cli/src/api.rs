//! Alist REST client
//!
//! Thin, retry-free wrapper over the remote file-listing API. Public calls
//! never return errors: any transport failure, non-2xx status or envelope
//! `code != 200` is logged and surfaces as `None` / `false`.

use crate::config::EffectiveConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Read/write granularity for streamed bodies.
pub const CHUNK_SIZE: usize = 8 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// --- Wire types ---

/// One remote file or directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default, deserialize_with = "non_negative")]
    pub size: u64,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    /// Only set on search hits.
    #[serde(default)]
    pub parent: Option<String>,
}

/// Result of one directory listing or search page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: Vec<Entry>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Debug, Serialize)]
struct ListRequest<'a> {
    path: &'a str,
    password: &'a str,
    page: u32,
    per_page: u32,
    refresh: bool,
}

#[derive(Debug, Serialize)]
struct GetRequest<'a> {
    path: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    parent: &'a str,
    keywords: &'a str,
    scope: u8,
    page: u32,
    per_page: u32,
}

/// Search scope as understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    All,
    DirectoriesOnly,
    FilesOnly,
}

impl SearchScope {
    fn id(&self) -> u8 {
        match self {
            SearchScope::All => 0,
            SearchScope::DirectoriesOnly => 1,
            SearchScope::FilesOnly => 2,
        }
    }
}

fn non_negative<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let value = Option::<i64>::deserialize(d)?;
    Ok(value.unwrap_or(0).max(0) as u64)
}

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Entry>, D::Error> {
    Ok(Option::<Vec<Entry>>::deserialize(d)?.unwrap_or_default())
}

// --- Client ---

/// One logical session against an Alist server. A token obtained by login
/// lives only as long as this value.
pub struct AlistClient {
    base_url: String,
    username: String,
    password: String,
    preset_token: String,
    login_token: OnceCell<Option<String>>,
    client: reqwest::Client,
    timeout: Duration,
}

impl AlistClient {
    pub fn new(base_url: &str, username: &str, password: &str, token: &str) -> Self {
        Self::with_http(reqwest::Client::new(), base_url, username, password, token)
    }

    /// Reuse an existing connection pool.
    pub fn with_http(
        client: reqwest::Client,
        base_url: &str,
        username: &str,
        password: &str,
        token: &str,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            preset_token: token.trim().to_string(),
            login_token: OnceCell::new(),
            client,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_config(client: reqwest::Client, cfg: &EffectiveConfig) -> Self {
        Self::with_http(client, &cfg.server_url, &cfg.username, &cfg.password, &cfg.token)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Token for the `Authorization` header, logging in at most once.
    async fn auth_token(&self) -> Option<String> {
        if !self.preset_token.is_empty() {
            return Some(self.preset_token.clone());
        }
        if self.username.is_empty() || self.password.is_empty() {
            return None;
        }
        self.login_token
            .get_or_init(|| async { self.login().await })
            .await
            .clone()
    }

    pub async fn login(&self) -> Option<String> {
        let resp = self
            .client
            .post(format!("{}/api/auth/login", self.base_url))
            .timeout(self.timeout)
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await;
        let data: Option<LoginData> = logged("login", Self::parse_envelope(resp).await);
        data.map(|d| d.token)
    }

    /// Check response status and unwrap the `{code, message, data}` envelope.
    async fn parse_envelope<T: DeserializeOwned>(
        resp: reqwest::Result<reqwest::Response>,
    ) -> anyhow::Result<T> {
        let resp = resp?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {}: {}", status, body);
        }
        let envelope: Envelope<T> = resp.json().await?;
        if envelope.code != 200 {
            anyhow::bail!("API error ({}): {}", envelope.code, envelope.message);
        }
        envelope
            .data
            .ok_or_else(|| anyhow::anyhow!("API response carried no data"))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        let mut req = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .timeout(self.timeout)
            .json(body);
        if let Some(token) = self.auth_token().await {
            req = req.header(reqwest::header::AUTHORIZATION, token);
        }
        Self::parse_envelope(req.send().await).await
    }

    pub async fn list_directory(&self, path: &str, page: u32, per_page: u32) -> Option<Listing> {
        let body = ListRequest {
            path,
            password: "",
            page,
            per_page,
            refresh: false,
        };
        logged(
            &format!("list {}", path),
            self.post_json("/api/fs/list", &body).await,
        )
    }

    pub async fn stat(&self, path: &str) -> Option<Entry> {
        let body = GetRequest { path, password: "" };
        logged(
            &format!("stat {}", path),
            self.post_json("/api/fs/get", &body).await,
        )
    }

    pub async fn search(
        &self,
        keyword: &str,
        parent: &str,
        scope: SearchScope,
        page: u32,
        per_page: u32,
    ) -> Option<Listing> {
        let body = SearchRequest {
            parent,
            keywords: keyword,
            scope: scope.id(),
            page,
            per_page,
        };
        logged(
            &format!("search {:?} in {}", keyword, parent),
            self.post_json("/api/fs/search", &body).await,
        )
    }

    /// Direct download URL for a file; `None` for directories or unknown paths.
    pub async fn download_locator(&self, path: &str) -> Option<String> {
        let entry = self.stat(path).await?;
        if entry.is_dir {
            return None;
        }
        Some(format!("{}/d{}", self.base_url, encode_path(path)))
    }

    /// Start a streamed GET of a download locator. Only 2xx responses are
    /// handed back.
    pub async fn open_download(&self, url: &str) -> Option<reqwest::Response> {
        let mut req = self.client.get(url);
        if let Some(token) = self.auth_token().await {
            req = req.header(reqwest::header::AUTHORIZATION, token);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => Some(resp),
            Ok(resp) => {
                tracing::error!("download {} failed: HTTP {}", url, resp.status());
                None
            }
            Err(e) => {
                tracing::error!("download {} failed: {}", url, e);
                None
            }
        }
    }

    /// Upload a local file into `target_dir` as `filename`, streaming the body
    /// from disk.
    pub async fn put_file(&self, local_path: &Path, target_dir: &str, filename: &str) -> bool {
        let result = self.put_file_inner(local_path, target_dir, filename).await;
        logged::<()>(&format!("upload {}", filename), result).is_some()
    }

    async fn put_file_inner(
        &self,
        local_path: &Path,
        target_dir: &str,
        filename: &str,
    ) -> anyhow::Result<()> {
        let file = tokio::fs::File::open(local_path).await?;
        let size = file.metadata().await?.len();
        let stream = tokio_util::io::ReaderStream::with_capacity(file, CHUNK_SIZE);

        let remote_path = format!("{}/{}", target_dir.trim_end_matches('/'), filename);
        let mut req = self
            .client
            .put(format!("{}/api/fs/put", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .header("File-Path", encode_path(&remote_path))
            .body(reqwest::Body::wrap_stream(stream));
        if let Some(token) = self.auth_token().await {
            req = req.header(reqwest::header::AUTHORIZATION, token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {}", status);
        }
        let envelope: Envelope<serde_json::Value> = resp.json().await?;
        if envelope.code != 200 {
            anyhow::bail!("API error ({}): {}", envelope.code, envelope.message);
        }
        Ok(())
    }
}

fn logged<T>(what: &str, result: anyhow::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!("{} failed: {:#}", what, e);
            None
        }
    }
}

/// Percent-encode every path segment, keeping `/` separators.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
