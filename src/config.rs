//! Configuration management for gsg

use crate::error::{Error, Result};
use crate::retry::{Backoff, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default workers per pool level when multi-threading is enabled
pub const DEFAULT_CONCURRENCY: usize = 256;

/// Upper bound on workers per pool level
pub const MAX_CONCURRENCY: usize = 1000;

/// Default download chunk size (16MB)
pub const DEFAULT_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Default lock TTL (24h)
pub const DEFAULT_LOCK_TTL_SECS: u64 = 24 * 3600;

/// Directory component every inter-cloud staging path must carry
pub const STAGING_MARKER: &str = "_icw_";

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ==================== Concurrency ====================

    /// Enable concurrent workers (otherwise one worker per level)
    pub multi_thread: bool,

    /// Workers per pool level when multi-threading is enabled
    pub concurrency: usize,

    // ==================== Transfer ====================

    /// Byte range size for chunked downloads
    pub chunk_size: u64,

    /// Show progress bars
    pub progress: bool,

    /// Root directory for inter-cloud staging
    pub staging_dir: PathBuf,

    /// Directory for CRC32C and lock-token caches (None = platform cache dir)
    pub cache_dir: Option<PathBuf>,

    // ==================== Process ====================

    /// Return errors to the host program instead of exiting
    pub embedded: bool,

    /// Default TTL for `lock` in seconds
    pub lock_ttl_secs: u64,

    // ==================== Retry ====================

    /// Opt-in retry settings
    pub retry: RetrySettings,
}

/// Retry block of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, including the first
    pub attempts: u32,

    /// Base delay in milliseconds
    pub delay_ms: u64,

    /// "none", "linear" or "exponential"
    pub backoff: String,

    /// Backoff multiplier
    pub factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 100,
            backoff: "linear".to_string(),
            factor: 1.0,
        }
    }
}

impl RetrySettings {
    /// Build the runtime retry policy
    pub fn to_retry_config(&self) -> Result<RetryConfig> {
        let backoff = match self.backoff.to_lowercase().as_str() {
            "none" => Backoff::None,
            "linear" => Backoff::Linear(self.factor),
            "exponential" => Backoff::Exponential(self.factor),
            other => {
                return Err(Error::config(format!("unknown retry backoff: {}", other)));
            }
        };
        Ok(RetryConfig {
            max_attempts: self.attempts.max(1),
            delay: Duration::from_millis(self.delay_ms),
            backoff,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multi_thread: false,
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress: false,
            staging_dir: PathBuf::from(STAGING_MARKER),
            cache_dir: None,
            embedded: false,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            retry: RetrySettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io("reading config", e))?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("creating config dir", e))?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("serializing config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| Error::io("writing config", e))?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("gsg").join("config.toml"))
            .ok_or_else(|| Error::config("could not determine config directory"))
    }

    /// Workers per pool level: 1 unless multi-threading is on, clamped to 1..=1000
    pub fn effective_workers(&self) -> usize {
        if !self.multi_thread {
            return 1;
        }
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    /// Resolve the cache directory
    pub fn effective_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("gsg")
        })
    }

    /// Chunk size, never zero
    pub fn effective_chunk_size(&self) -> u64 {
        self.chunk_size.max(1)
    }

    /// Parse a size string like "100", "100K", "100M", "100G" into bytes
    pub fn parse_size(s: &str) -> Result<u64> {
        let s = s.trim().to_uppercase();
        if s.is_empty() {
            return Ok(0);
        }

        let (num_part, suffix) = if let Some(n) = s.strip_suffix("KB") {
            (n, 1024u64)
        } else if let Some(n) = s.strip_suffix("MB") {
            (n, 1024u64 * 1024)
        } else if let Some(n) = s.strip_suffix("GB") {
            (n, 1024u64 * 1024 * 1024)
        } else if let Some(n) = s.strip_suffix('K') {
            (n, 1024u64)
        } else if let Some(n) = s.strip_suffix('M') {
            (n, 1024u64 * 1024)
        } else if let Some(n) = s.strip_suffix('G') {
            (n, 1024u64 * 1024 * 1024)
        } else {
            (s.as_str(), 1u64)
        };

        let num: u64 = num_part
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("invalid size value: {}", s)))?;

        Ok(num * suffix)
    }
}
