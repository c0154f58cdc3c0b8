//! Error types for the sync core

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for the sync core
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Check if error is retryable on a later trigger
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_transient() || e.is_unauthorized(),
            SyncError::StorageUnavailable(_) | SyncError::Io(_) => true,
            _ => false,
        }
    }

    /// Check if the local store should fall back to memory-only operation
    pub fn is_storage_degradation(&self) -> bool {
        matches!(
            self,
            SyncError::QuotaExceeded(_) | SyncError::StorageUnavailable(_)
        )
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => SyncError::QuotaExceeded(err.to_string()),
            Some(ErrorCode::CannotOpen)
            | Some(ErrorCode::ReadOnly)
            | Some(ErrorCode::DatabaseBusy)
            | Some(ErrorCode::DatabaseLocked)
            | Some(ErrorCode::SystemIoFailure) => SyncError::StorageUnavailable(err.to_string()),
            _ => SyncError::Database(err),
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_disk_full_maps_to_quota() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            Some("database or disk is full".to_string()),
        );
        let mapped = SyncError::from(err);
        assert!(matches!(mapped, SyncError::QuotaExceeded(_)));
        assert!(mapped.is_storage_degradation());
    }

    #[test]
    fn test_constraint_maps_to_database() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        let mapped = SyncError::from(err);
        assert!(matches!(mapped, SyncError::Database(_)));
        assert!(!mapped.is_storage_degradation());
    }

    #[test]
    fn test_retryable_follows_remote_classification() {
        let transient = SyncError::Remote(RemoteError::Timeout(Duration::from_secs(1)));
        assert!(transient.is_retryable());

        let rejected = SyncError::Remote(RemoteError::Rejected {
            status: 409,
            message: "duplicate key".to_string(),
        });
        assert!(!rejected.is_retryable());
    }
}
