//! Durable local storage for the offline cache
//!
//! SQLite (WAL or DELETE journal) behind the `LocalStore` trait, plus an
//! in-memory implementation and the write-through guard that degrades to
//! memory-only operation on storage failures.

mod backend;
mod connection;
mod durable;
mod memory_backend;
mod migrations;
pub mod queries;
mod sqlite_backend;

pub use backend::{HealthStatus, LocalStore};
pub use connection::{Storage, StorageOptions};
pub use durable::DurableStore;
pub use memory_backend::MemoryStore;
pub use migrations::SCHEMA_VERSION;
pub use sqlite_backend::SqliteStore;
