//! Remote backend abstraction
//!
//! The hosted relational store is consumed per table through
//! `select/insert/update/delete/upsert`. `RemoteBackend` is the untyped seam
//! the sync engine talks to; `Repository<T>` layers a typed, one-method-per-
//! operation interface on top for application code.

mod memory;
#[cfg(feature = "rest")]
mod rest;

pub use memory::InMemoryBackend;
#[cfg(feature = "rest")]
pub use rest::RestBackend;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors returned by a remote backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rejected by backend ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Session missing or expired; the same request may succeed after sign-in
    #[error("Not authorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Timeout(_))
    }

    /// Whether the backend refused the operation itself
    pub fn is_rejection(&self) -> bool {
        matches!(self, RemoteError::Rejected { .. })
    }

    /// Whether the request lacked a valid session. Nothing about the queued
    /// change is wrong, so it must not be dead-lettered.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Unauthorized { .. })
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Table-level operations against the hosted store.
///
/// Rows are JSON objects. `insert` and `update` may return the stored row
/// when the backend echoes it.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Whether a user session is available (gates the initial sync)
    async fn has_session(&self) -> bool {
        true
    }

    /// Rows of `table`, restricted to `updated_at >= since` when given
    async fn select(&self, table: &str, since: Option<DateTime<Utc>>) -> RemoteResult<Vec<Value>>;

    async fn insert(&self, table: &str, row: &Value) -> RemoteResult<Option<Value>>;

    async fn update(&self, table: &str, id: &str, patch: &Value) -> RemoteResult<Option<Value>>;

    async fn delete(&self, table: &str, id: &str) -> RemoteResult<()>;

    async fn upsert(&self, table: &str, rows: &[Value]) -> RemoteResult<Vec<Value>>;
}

/// Typed access to one remote table
pub struct Repository<T> {
    remote: Arc<dyn RemoteBackend>,
    table: String,
    _row: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            remote: self.remote.clone(),
            table: self.table.clone(),
            _row: PhantomData,
        }
    }
}

impl<T> Repository<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(remote: Arc<dyn RemoteBackend>, table: impl Into<String>) -> Self {
        Self {
            remote,
            table: table.into(),
            _row: PhantomData,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn list(&self) -> RemoteResult<Vec<T>> {
        self.list_since(None).await
    }

    pub async fn list_since(&self, since: Option<DateTime<Utc>>) -> RemoteResult<Vec<T>> {
        let rows = self.remote.select(&self.table, since).await?;
        rows.into_iter().map(|row| self.decode(row)).collect()
    }

    pub async fn insert(&self, row: &T) -> RemoteResult<Option<T>> {
        let value = self.encode(row)?;
        let stored = self.remote.insert(&self.table, &value).await?;
        stored.map(|row| self.decode(row)).transpose()
    }

    pub async fn update(&self, id: &str, row: &T) -> RemoteResult<Option<T>> {
        let value = self.encode(row)?;
        let stored = self.remote.update(&self.table, id, &value).await?;
        stored.map(|row| self.decode(row)).transpose()
    }

    pub async fn delete(&self, id: &str) -> RemoteResult<()> {
        self.remote.delete(&self.table, id).await
    }

    pub async fn upsert(&self, rows: &[T]) -> RemoteResult<Vec<T>> {
        let values = rows
            .iter()
            .map(|row| self.encode(row))
            .collect::<RemoteResult<Vec<_>>>()?;
        let stored = self.remote.upsert(&self.table, &values).await?;
        stored.into_iter().map(|row| self.decode(row)).collect()
    }

    fn encode(&self, row: &T) -> RemoteResult<Value> {
        serde_json::to_value(row)
            .map_err(|e| RemoteError::Malformed(format!("{} row: {}", self.table, e)))
    }

    fn decode(&self, row: Value) -> RemoteResult<T> {
        serde_json::from_value(row)
            .map_err(|e| RemoteError::Malformed(format!("{} row: {}", self.table, e)))
    }
}
