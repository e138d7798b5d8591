//! pdsync Store - Local state persistence
//!
//! SQLite-backed implementation of the `StateStore` port:
//! - Per-path change tokens and content hashes
//! - Local path to remote node mappings
//! - The durable job queue with claim/complete/fail transactions
//! - The control signal queue
//!
//! ## Key Components
//!
//! - [`pool::open`] / [`pool::open_in_memory`] - migrated connection pools
//! - [`migrations`] - the versioned, forward-only schema chain
//! - [`SqliteStateStore`] - Full `StateStore` implementation
//! - [`StoreError`] - Error types for store operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use pdsync_store::{pool, SqliteStateStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = pool::open(Path::new("/home/user/.local/state/pdsync/state.db")).await?;
//! let store = SqliteStateStore::new(pool);
//! // Use store as StateStore...
//! # Ok(())
//! # }
//! ```

pub mod migrations;
pub mod pool;
pub mod store;

pub use store::SqliteStateStore;

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored value could not be mapped back to a domain type
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::QueryFailed(e.to_string())
    }
}
