//! Engine configuration
//!
//! Loaded once from TOML, validated, then passed by reference to every
//! component. There is no process-wide configuration singleton; the
//! [`EngineContext`](crate::engine::EngineContext) owns the single instance.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EngineError;

/// Engine configuration with deployment-tunable constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Service account used for directory and mailbox access
    #[serde(default)]
    pub service_account: String,

    /// Root discovery endpoint URL
    #[serde(default)]
    pub discovery_url: String,

    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Folders tracked per mailbox
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,

    /// Upper bound for concurrent remote work; discovery and baseline
    /// fan-out run at half of this
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Addresses per discovery call
    #[serde(default = "default_discovery_batch_size")]
    pub discovery_batch_size: usize,

    /// Item cap per incremental-sync page
    #[serde(default = "default_sync_page_size")]
    pub sync_page_size: u32,

    /// Mailboxes per subscription group
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Global cap on concurrently pending subscribe calls across all groups
    #[serde(default = "default_max_pending_subscribes")]
    pub max_pending_subscribes: usize,

    /// Lifetime of one pipeline incarnation before a full teardown/restart
    #[serde(default = "default_recycle_minutes")]
    pub recycle_minutes: u64,

    /// Callback coalescing window
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Jitter bounds for the retry backoff sleep
    #[serde(default = "default_retry_min_delay_ms")]
    pub retry_min_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Redirect hops tolerated while chasing a discovery endpoint
    #[serde(default = "default_redirect_max_hops")]
    pub redirect_max_hops: u32,

    /// Cool-down after the directory reports "busy"
    #[serde(default = "default_busy_cooldown_secs")]
    pub busy_cooldown_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_account: String::new(),
            discovery_url: String::new(),
            db_path: default_db_path(),
            folders: default_folders(),
            max_concurrency: default_max_concurrency(),
            discovery_batch_size: default_discovery_batch_size(),
            sync_page_size: default_sync_page_size(),
            max_batch_size: default_max_batch_size(),
            max_pending_subscribes: default_max_pending_subscribes(),
            recycle_minutes: default_recycle_minutes(),
            debounce_ms: default_debounce_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_min_delay_ms: default_retry_min_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            redirect_max_hops: default_redirect_max_hops(),
            busy_cooldown_secs: default_busy_cooldown_secs(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: EngineConfig = toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.service_account.trim().is_empty() {
            return Err(EngineError::Config("service_account is required".into()));
        }
        if self.discovery_url.trim().is_empty() {
            return Err(EngineError::Config("discovery_url is required".into()));
        }
        if self.folders.is_empty() {
            return Err(EngineError::Config("at least one folder is required".into()));
        }
        if self.max_concurrency < 2 {
            return Err(EngineError::Config("max_concurrency must be at least 2".into()));
        }
        if self.max_batch_size == 0 || self.discovery_batch_size == 0 {
            return Err(EngineError::Config("batch sizes must be positive".into()));
        }
        if self.retry_min_delay_ms > self.retry_max_delay_ms {
            return Err(EngineError::Config(
                "retry_min_delay_ms must not exceed retry_max_delay_ms".into(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(EngineError::Config("retry_max_attempts must be positive".into()));
        }
        Ok(())
    }

    /// Concurrency cap for discovery and baseline fan-out.
    pub fn discovery_concurrency(&self) -> usize {
        (self.max_concurrency / 2).max(1)
    }

    pub fn recycle_period(&self) -> Duration {
        Duration::from_secs(self.recycle_minutes * 60)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn busy_cooldown(&self) -> Duration {
        Duration::from_secs(self.busy_cooldown_secs)
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailwatch")
        .join("engine.db")
}

fn default_folders() -> Vec<String> {
    vec!["Inbox".to_string(), "Calendar".to_string()]
}

fn default_max_concurrency() -> usize {
    20
}

fn default_discovery_batch_size() -> usize {
    10
}

fn default_sync_page_size() -> u32 {
    512
}

fn default_max_batch_size() -> usize {
    200
}

fn default_max_pending_subscribes() -> usize {
    1000
}

fn default_recycle_minutes() -> u64 {
    30
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_min_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    2000
}

fn default_redirect_max_hops() -> u32 {
    10
}

fn default_busy_cooldown_secs() -> u64 {
    30
}
