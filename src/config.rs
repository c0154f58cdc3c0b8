//! Runtime configuration
//!
//! Every field has a serde default so a partial TOML file is enough.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::queue::RetryPolicy;
use crate::types::{default_tables, SyncTable};

/// Journal mode for the SQLite cache file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// WAL journal, for a cache on local disk
    #[default]
    Local,
    /// Single-file DELETE journal, for a cache inside a synced folder
    CloudSafe,
}

impl std::str::FromStr for StorageMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(StorageMode::Local),
            "cloud-safe" => Ok(StorageMode::CloudSafe),
            _ => Err(SyncError::Config(format!("Unknown storage mode: {}", s))),
        }
    }
}

/// How a pulled remote row is reconciled with a pending local change to the
/// same record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Newer `updated_at` wins; superseded local changes are dead-lettered
    #[default]
    LastWriterWins,
    /// Pending local changes always win and are pushed
    PreferLocal,
}

/// Remote backend connection settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the hosted backend (e.g. `https://project.example.co`)
    pub url: Option<String>,
    /// Public API key sent as `apikey`
    pub api_key: Option<String>,
    /// User session token sent as a bearer token
    pub access_token: Option<String>,
}

/// Sync core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Path to the SQLite cache (`:memory:` for an ephemeral cache)
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub storage_mode: StorageMode,
    /// Upper bound on the cache file size
    #[serde(default)]
    pub quota_bytes: Option<u64>,
    #[serde(default = "default_tables")]
    pub tables: Vec<SyncTable>,
    /// Periodic sync interval while online (0 disables the timer)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Bound on every remote call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Start a push as soon as a change is queued while online
    #[serde(default = "default_true")]
    pub push_on_write: bool,
    #[serde(default)]
    pub remote: RemoteConfig,
}

fn default_db_path() -> String {
    "~/.local/share/tenarch/offline.db".to_string()
}

fn default_sync_interval() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            storage_mode: StorageMode::default(),
            quota_bytes: None,
            tables: default_tables(),
            sync_interval_secs: default_sync_interval(),
            request_timeout_ms: default_request_timeout(),
            retry: RetryPolicy::default(),
            conflict_policy: ConflictPolicy::default(),
            push_on_write: true,
            remote: RemoteConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Ephemeral configuration: in-memory cache, no timer, no push-on-write
    pub fn in_memory() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            sync_interval_secs: 0,
            push_on_write: false,
            ..Self::default()
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(SyncError::Config("at least one table must be configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(SyncError::Config("table names must not be empty".into()));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(SyncError::Config(format!("duplicate table: {}", table.name)));
            }
        }
        if self.request_timeout_ms == 0 {
            return Err(SyncError::Config("request_timeout_ms must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be positive".into()));
        }
        Ok(())
    }

    /// Expand `~` in the cache path
    pub fn expanded_db_path(&self) -> String {
        shellexpand::tilde(&self.db_path).to_string()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }

    /// Look up a registered table
    pub fn table(&self, name: &str) -> Option<&SyncTable> {
        self.tables.iter().find(|t| t.name == name)
    }
}
