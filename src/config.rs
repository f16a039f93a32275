//! Configuration for courseware-storage

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StorageError};

/// Default storage directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("courseware-storage")
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Production
    }
}

impl std::str::FromStr for Environment {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(StorageError::Config(format!("unknown environment: {}", other))),
        }
    }
}

/// Configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub environment: Environment,

    #[serde(default)]
    pub storage: StorageSection,

    /// Primary transport (bot API). Absent = disabled.
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,

    /// Secondary S3-compatible object store. Absent = disabled.
    #[serde(default)]
    pub r2: Option<R2Config>,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Root for the sled databases and the local blob fallback
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
    /// Bot API upload limit
    #[serde(default = "default_telegram_max_upload")]
    pub max_upload_bytes: usize,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

fn default_telegram_max_upload() -> usize {
    50 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct R2Config {
    /// e.g. https://<account>.r2.cloudflarestorage.com
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_r2_region")]
    pub region: String,
    #[serde(default = "default_r2_folder")]
    pub folder: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

fn default_r2_region() -> String {
    "auto".to_string()
}

fn default_r2_folder() -> String {
    "course-blobs".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
    #[serde(default = "default_max_refreshes")]
    pub max_background_refreshes: usize,
}

fn default_stale_after() -> u64 {
    30
}

fn default_max_age() -> u64 {
    300
}

fn default_max_refreshes() -> usize {
    4
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            max_age_secs: default_max_age(),
            max_background_refreshes: default_max_refreshes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Timeout applied to every backend and index call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Consecutive failed passes before a visible warning
    #[serde(default = "default_warn_after")]
    pub warn_after_failures: u32,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_warn_after() -> u32 {
    3
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            warn_after_failures: default_warn_after(),
        }
    }
}

impl SyncSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| StorageError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override secrets and toggles from environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(env) = std::env::var("COURSEWARE_ENV") {
            self.environment = env.parse()?;
        }

        if let (Ok(bot_token), Ok(chat_id)) = (
            std::env::var("TELEGRAM_BOT_TOKEN"),
            std::env::var("TELEGRAM_CHAT_ID"),
        ) {
            let telegram = self.telegram.get_or_insert_with(|| TelegramConfig {
                api_base: default_telegram_api(),
                bot_token: String::new(),
                chat_id: String::new(),
                max_upload_bytes: default_telegram_max_upload(),
            });
            telegram.bot_token = bot_token;
            telegram.chat_id = chat_id;
        }

        if let (Ok(endpoint), Ok(bucket), Ok(access_key_id), Ok(secret_access_key)) = (
            std::env::var("R2_ENDPOINT"),
            std::env::var("R2_BUCKET"),
            std::env::var("R2_ACCESS_KEY_ID"),
            std::env::var("R2_SECRET_ACCESS_KEY"),
        ) {
            self.r2 = Some(R2Config {
                endpoint,
                bucket,
                region: default_r2_region(),
                folder: self
                    .r2
                    .as_ref()
                    .map(|r2| r2.folder.clone())
                    .unwrap_or_else(default_r2_folder),
                access_key_id,
                secret_access_key,
            });
        }

        Ok(())
    }

    /// Whether the local filesystem backend may take writes.
    /// Production surfaces chain failures instead.
    pub fn local_fallback_enabled(&self) -> bool {
        match self.environment {
            Environment::Production => false,
            Environment::Development => true,
        }
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.storage.data_dir.join("blobs")
    }

    pub fn unit_cache_path(&self) -> PathBuf {
        self.storage.data_dir.join("units.sled")
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.storage.data_dir.join("metadata.sled")
    }

    pub fn config_path(&self) -> PathBuf {
        self.storage.data_dir.join("config.toml")
    }
}
