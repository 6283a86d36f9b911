use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::cache::EvictionPolicy;
use crate::error::ConfigError;

const APP_DIR: &str = "wallhaven-viewer";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    /// `{id}` is replaced with the picture id.
    pub thumbnail_url: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub policy: EvictionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub stream_chunk_size: usize,
    pub range_block_size: u64,
    pub range_concurrency: usize,
    pub range_retries: u32,
    pub retry_backoff_ms: u64,
    pub grid_concurrency: usize,
    /// Origins reporting more than this many bytes are refused.
    pub max_picture_size: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://alpha.wallhaven.cc".to_string(),
            thumbnail_url: "https://alpha.wallhaven.cc/wallpapers/thumb/small/th-{id}.jpg"
                .to_string(),
            user_agent: concat!("wallhaven-viewer/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout_secs: 20,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 48,
            policy: EvictionPolicy::Lru,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            stream_chunk_size: 128 * 1024,
            range_block_size: 512 * 1024,
            range_concurrency: 4,
            range_retries: 3,
            retry_backoff_ms: 250,
            grid_concurrency: 4,
            max_picture_size: 256 * 1024 * 1024,
        }
    }
}

impl SourceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl FetchConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.json")
}

pub fn default_download_dir() -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        return home.join("Pictures").join("WallHaven");
    }
    PathBuf::from("./WallHaven")
}

impl Config {
    /// Reads the user config, falling back to defaults when it is missing or broken.
    pub fn load() -> Self {
        let path = config_path();
        if !path.exists() {
            return Config::with_defaults();
        }
        match Config::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("ignoring config: {}", e);
                Config::with_defaults()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        if config.download_dir.as_os_str().is_empty() {
            config.download_dir = default_download_dir();
        }
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, content).map_err(io_err)
    }

    pub fn with_defaults() -> Self {
        Self {
            download_dir: default_download_dir(),
            ..Default::default()
        }
    }
}
