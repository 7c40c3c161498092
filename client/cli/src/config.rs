use crate::error::{NavError, NavResult};
use crate::store::JsonStore;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

const DEFAULT_EXTENSIONS: &str = ".txt,.pdf,.doc,.docx,.zip,.rar,.jpg,.png,.gif,.mp4,.mp3";

/// Keys a user may change with `config set`.
pub const USER_KEYS: &[&str] = &[
    "alist_url",
    "username",
    "password",
    "token",
    "max_display_files",
];

const USERS_DIR: &str = "users";

/// Administrator settings: the global layer of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_alist_url: String,
    pub default_username: String,
    pub default_password: String,
    pub default_token: String,
    pub max_display_files: usize,
    /// Comma separated, e.g. `.txt,.pdf`
    pub allowed_extensions: String,
    pub enable_preview: bool,
    /// Per-user isolation. When off, every user shares the global connection.
    pub require_user_auth: bool,
    pub enable_cache: bool,
    /// Seconds
    pub cache_duration: u64,
    /// MiB
    pub max_download_size: u64,
    /// MiB
    pub max_upload_size: u64,
    pub upload_timeout_secs: u64,
    pub cleanup_delay_secs: u64,
    pub request_timeout_secs: u64,
    /// Upper bound on live per-user sessions before LRU eviction.
    pub session_capacity: usize,
    pub data_dir: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_alist_url: String::new(),
            default_username: String::new(),
            default_password: String::new(),
            default_token: String::new(),
            max_display_files: 20,
            allowed_extensions: DEFAULT_EXTENSIONS.to_string(),
            enable_preview: true,
            require_user_auth: true,
            enable_cache: true,
            cache_duration: 300,
            max_download_size: 50,
            max_upload_size: 100,
            upload_timeout_secs: 600,
            cleanup_delay_secs: 10,
            request_timeout_secs: 30,
            session_capacity: 1024,
            data_dir: None,
        }
    }
}

impl Settings {
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "alistnav", "alistnav")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        let config_dir = proj_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;

        Ok(config_dir.join("config.toml"))
    }

    /// Load settings from `path` (or the platform config file), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            Settings::default()
        };
        settings.apply_env();
        Ok(settings)
    }

    pub fn save(&self, path: Option<&Path>) -> anyhow::Result<()> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("ALISTNAV_URL") {
            self.default_alist_url = url;
        }
        if let Ok(username) = std::env::var("ALISTNAV_USERNAME") {
            self.default_username = username;
        }
        if let Ok(password) = std::env::var("ALISTNAV_PASSWORD") {
            self.default_password = password;
        }
        if let Ok(token) = std::env::var("ALISTNAV_TOKEN") {
            self.default_token = token;
        }
        if let Ok(dir) = std::env::var("ALISTNAV_DATA_DIR") {
            self.data_dir = Some(dir);
        }
        if let Ok(flag) = std::env::var("ALISTNAV_REQUIRE_USER_AUTH") {
            match flag.parse() {
                Ok(value) => self.require_user_auth = value,
                Err(_) => tracing::warn!("ignoring ALISTNAV_REQUIRE_USER_AUTH={}", flag),
            }
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return PathBuf::from(dir);
        }
        ProjectDirs::from("com", "alistnav", "alistnav")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    pub fn max_download_bytes(&self) -> u64 {
        self.max_download_size * MIB
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size * MIB
    }

    pub fn extension_set(&self) -> BTreeSet<String> {
        self.allowed_extensions
            .split(',')
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

/// What a user has stored with `config set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub alist_url: String,
    pub username: String,
    pub password: String,
    pub token: String,
    pub max_display_files: usize,
    pub setup_completed: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            alist_url: String::new(),
            username: String::new(),
            password: String::new(),
            token: String::new(),
            max_display_files: 20,
            setup_completed: false,
        }
    }
}

/// Configuration in force for one request. Built fresh every time.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub server_url: String,
    pub username: String,
    pub password: String,
    pub token: String,
    pub max_display_entries: usize,
    pub allowed_extensions: BTreeSet<String>,
    pub preview_enabled: bool,
}

impl EffectiveConfig {
    pub fn require_server(&self) -> NavResult<&str> {
        if self.server_url.trim().is_empty() {
            Err(NavError::ConfigurationMissing)
        } else {
            Ok(&self.server_url)
        }
    }
}

/// Merges defaults, administrator settings and per-user values.
#[derive(Clone)]
pub struct ConfigResolver {
    settings: Arc<Settings>,
    store: JsonStore,
}

impl ConfigResolver {
    pub fn new(settings: Arc<Settings>, store: JsonStore) -> Self {
        Self { settings, store }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn resolve(&self, user_id: &str) -> EffectiveConfig {
        let s = &self.settings;
        let mut cfg = EffectiveConfig {
            server_url: s.default_alist_url.clone(),
            username: s.default_username.clone(),
            password: s.default_password.clone(),
            token: s.default_token.clone(),
            max_display_entries: s.max_display_files.clamp(1, 100),
            allowed_extensions: s.extension_set(),
            preview_enabled: s.enable_preview,
        };

        if !s.require_user_auth {
            return cfg;
        }

        // Display settings stay administrator-controlled; only the connection
        // fields can be overridden, and only by non-empty values.
        let user = self.load_user(user_id);
        override_non_empty(&mut cfg.server_url, user.alist_url);
        override_non_empty(&mut cfg.username, user.username);
        override_non_empty(&mut cfg.password, user.password);
        override_non_empty(&mut cfg.token, user.token);
        cfg
    }

    pub fn is_configured(&self, user_id: &str) -> bool {
        let cfg = self.resolve(user_id);
        if cfg.server_url.trim().is_empty() {
            return false;
        }
        if !self.settings.require_user_auth {
            return true;
        }
        self.load_user(user_id).setup_completed
    }

    pub fn load_user(&self, user_id: &str) -> UserConfig {
        match self.store.read::<UserConfig>(USERS_DIR, user_id) {
            Ok(Some(config)) => config,
            Ok(None) => UserConfig::default(),
            Err(e) => {
                tracing::error!("failed to load config for user {}: {:#}", user_id, e);
                UserConfig::default()
            }
        }
    }

    pub fn save_user(&self, user_id: &str, config: &UserConfig) -> NavResult<()> {
        self.store.write(USERS_DIR, user_id, config).map_err(|e| {
            tracing::error!("failed to save config for user {}: {:#}", user_id, e);
            NavError::Storage(e.to_string())
        })
    }

    /// Apply one `config set <key> <value>`.
    pub fn set_user_value(&self, user_id: &str, key: &str, value: &str) -> NavResult<()> {
        if !USER_KEYS.contains(&key) {
            return Err(NavError::BadArgument(format!(
                "unknown key: {}. valid keys: {}",
                key,
                USER_KEYS.join(", ")
            )));
        }
        if value.is_empty() {
            return Err(NavError::BadArgument(format!("missing value for {}", key)));
        }

        let mut user = self.load_user(user_id);
        match key {
            "alist_url" => {
                user.alist_url = value.trim_end_matches('/').to_string();
                user.setup_completed = true;
            }
            "username" => user.username = value.to_string(),
            "password" => user.password = value.to_string(),
            "token" => user.token = value.to_string(),
            "max_display_files" => {
                let n: usize = value.parse().map_err(|_| {
                    NavError::BadArgument("max_display_files must be a number".to_string())
                })?;
                if !(1..=100).contains(&n) {
                    return Err(NavError::BadArgument(
                        "max_display_files must be between 1 and 100".to_string(),
                    ));
                }
                user.max_display_files = n;
            }
            _ => unreachable!("key checked against USER_KEYS"),
        }
        self.save_user(user_id, &user)
    }
}

fn override_non_empty(slot: &mut String, value: String) {
    if !value.trim().is_empty() {
        *slot = value;
    }
}
