//! tenarch-sync - offline data cache for the tenarch CRM
//!
//! Keeps a durable local mirror of the CRM's remote tables, queues local
//! mutations while offline, and reconciles both with the hosted backend.

pub mod cache;
pub mod config;
pub mod error;
pub mod queue;
pub mod remote;
pub mod status;
pub mod storage;
pub mod sync;
pub mod types;

pub use cache::{
    merge_backups, normalize_backup, parse_backup, BackupFormat, CacheEvent, CacheStore,
    EventFilter, WriteSource,
};
pub use config::{ConflictPolicy, RemoteConfig, StorageMode, SyncConfig};
pub use error::{Result, SyncError};
pub use queue::RetryPolicy;
pub use remote::{InMemoryBackend, RemoteBackend, RemoteError, Repository};
pub use status::Subscription;
pub use sync::{SyncEngine, SyncTrigger};
pub use types::*;

#[cfg(feature = "rest")]
pub use remote::RestBackend;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
