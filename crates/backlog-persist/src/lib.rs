//! # Backlog Persistence
//!
//! Relational storage for Backlog queues.
//!
//! Supports:
//! - SQLite, file-backed (WAL) or in-memory (for testing)

pub mod database;
pub mod sqlite;

pub use database::{DatabaseBackend, CLAIM_ATTEMPTS};
pub use sqlite::{connect, SqliteConfig};
