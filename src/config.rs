//! Configuration for the sync core.
//!
//! Every section is optional in TOML; missing values fall back to the
//! defaults below. Durations are stored as milliseconds so the file stays
//! readable (`ping_timeout_ms = 10000`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Database id used to build realtime channel paths.
    pub database_id: String,
    pub connection: ConnectionConfig,
    pub cache: CacheConfig,
    pub governor: GovernorConfig,
    pub chat: ChatConfig,
    /// Remote server settings. `None` means the caller supplies its own backend.
    pub appwrite: Option<AppwriteConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_id: "default".to_string(),
            connection: ConnectionConfig::default(),
            cache: CacheConfig::default(),
            governor: GovernorConfig::default(),
            chat: ChatConfig::default(),
            appwrite: None,
        }
    }
}

/// Connection manager settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Hard timeout for the liveness ping.
    pub ping_timeout_ms: u64,
    /// Base delay for exponential reconnect backoff.
    pub base_delay_ms: u64,
    /// Reconnect attempts before giving up (terminal `disconnected`).
    pub max_attempts: u32,
    /// Ping period while connected.
    pub health_check_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: 10_000,
            base_delay_ms: 1_000,
            max_attempts: 5,
            health_check_interval_ms: 30_000,
        }
    }
}

impl ConnectionConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Cache store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Age after which `fetch_or_get` refetches instead of serving the cached value.
    pub stale_after_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 5 * 60 * 1000,
        }
    }
}

impl CacheConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Memory/lifecycle governor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GovernorConfig {
    /// Period of the stale-entry sweep.
    pub sweep_interval_ms: u64,
    /// Entries older than this (and unsubscribed) are evicted by the sweep.
    pub max_age_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 5 * 60 * 1000,
            max_age_ms: 30 * 60 * 1000,
        }
    }
}

impl GovernorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

/// Chat synchronizer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    /// Collection holding chat messages.
    pub messages_collection: String,
    /// Number of most recent messages fetched by `load_history`.
    pub history_limit: usize,
    /// Max `createdAt` distance for matching a server echo to a pending send.
    pub echo_match_window_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            messages_collection: "messages".to_string(),
            history_limit: 50,
            echo_match_window_ms: 10_000,
        }
    }
}

impl ChatConfig {
    pub fn echo_match_window(&self) -> Duration {
        Duration::from_millis(self.echo_match_window_ms)
    }
}

/// Appwrite-compatible server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppwriteConfig {
    /// API endpoint including the version prefix (e.g. `https://cloud.appwrite.io/v1`).
    pub endpoint: String,
    pub project_id: String,
    /// Server API key. Mobile builds normally leave this empty and use a session.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl AppwriteConfig {
    /// Load from environment variables.
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("APPWRITE_ENDPOINT").ok()?;
        let project_id = std::env::var("APPWRITE_PROJECT_ID").ok()?;
        let api_key = std::env::var("APPWRITE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        if endpoint.is_empty() || project_id.is_empty() {
            return None;
        }

        Some(Self {
            endpoint,
            project_id,
            api_key,
        })
    }
}

impl SyncConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(raw).context("Failed to parse sync config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// Load from the platform config dir, falling back to defaults when no
    /// file exists. Environment variables override the `[appwrite]` section.
    pub fn load_or_default() -> Result<Self> {
        let mut config = match default_config_path() {
            Some(path) if path.exists() => Self::load(&path)?,
            _ => Self::default(),
        };
        if let Some(appwrite) = AppwriteConfig::from_env() {
            config.appwrite = Some(appwrite);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_id.trim().is_empty() {
            anyhow::bail!("database_id cannot be empty");
        }
        if self.connection.ping_timeout_ms == 0 {
            anyhow::bail!("connection.ping_timeout_ms must be greater than zero");
        }
        if self.connection.max_attempts == 0 {
            anyhow::bail!("connection.max_attempts must be at least 1");
        }
        if self.connection.health_check_interval_ms == 0 {
            anyhow::bail!("connection.health_check_interval_ms must be greater than zero");
        }
        if self.governor.sweep_interval_ms == 0 {
            anyhow::bail!("governor.sweep_interval_ms must be greater than zero");
        }
        if self.governor.max_age_ms < self.cache.stale_after_ms {
            anyhow::bail!(
                "governor.max_age_ms ({}) must not be shorter than cache.stale_after_ms ({})",
                self.governor.max_age_ms,
                self.cache.stale_after_ms
            );
        }
        if self.chat.history_limit == 0 {
            anyhow::bail!("chat.history_limit must be at least 1");
        }
        if self.chat.messages_collection.trim().is_empty() {
            anyhow::bail!("chat.messages_collection cannot be empty");
        }
        Ok(())
    }
}

/// `<config dir>/zeroclaw-chat-sync/config.toml`, if the platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("ai", "zeroclaw", "zeroclaw-chat-sync")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
