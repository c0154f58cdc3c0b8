//! Sync engine
//!
//! Reconciles the local cache and change queue with the remote backend:
//! - Pull (full or incremental per table) then drain, one pass at a time
//! - Last-writer-wins conflict handling with dead-lettering
//! - Background worker reacting to connectivity, timer and explicit triggers

mod connectivity;
mod engine;
pub mod reconcile;
mod worker;

pub use connectivity::Connectivity;
pub use engine::SyncEngine;
pub use worker::{SyncWorker, WorkerCommand};

use serde::{Deserialize, Serialize};

/// What started a sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// First pass after `init()`
    AppStart,
    /// Connectivity came back
    Reconnect,
    /// Interval timer
    Periodic,
    /// Explicit call
    Manual,
    /// Platform background-sync message
    Background,
    /// Push started by a queued change
    LocalWrite,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::AppStart => "app_start",
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Background => "background",
            SyncTrigger::LocalWrite => "local_write",
        }
    }
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
