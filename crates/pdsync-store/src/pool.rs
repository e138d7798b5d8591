//! SQLite connection setup
//!
//! Two entry points, both of which run the versioned migration chain
//! before handing the pool to a caller, so no query ever sees a stale
//! schema: [`open`] for the on-disk state database and [`open_in_memory`]
//! for tests.
//!
//! Connection choices, and what breaks without them:
//! - WAL journal mode, so the status command can read while the engine's
//!   completion transactions write.
//! - A busy timeout, so the classifier's batch transaction and a
//!   processor task finishing at the same moment queue up instead of
//!   failing with `SQLITE_BUSY`.
//! - In-memory databases get exactly one connection: SQLite scopes
//!   `:memory:` per connection, and a second connection would see empty
//!   tables.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::{migrations, StoreError};

/// Connections kept open for the on-disk database. The engine, the
/// watcher batches and a status invocation are the only concurrent users;
/// a small pool is plenty.
const MAX_CONNECTIONS: u32 = 5;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the state database at `db_path`, apply pending
/// migrations, and return the ready pool.
///
/// Parent directories are created as needed; the XDG state directory
/// does not exist on a first run.
///
/// # Errors
///
/// `StoreError::ConnectionFailed` when the file cannot be created or
/// opened, `StoreError::MigrationFailed` when the schema cannot be
/// brought up to date.
pub async fn open(db_path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StoreError::ConnectionFailed(format!(
                "Failed to create database directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .map_err(|e| {
            StoreError::ConnectionFailed(format!(
                "Failed to open state database at {}: {e}",
                db_path.display()
            ))
        })?;

    migrations::run(&pool).await?;

    tracing::info!(path = %db_path.display(), "State database ready");
    Ok(pool)
}

/// Open a fresh, fully migrated in-memory database.
///
/// # Errors
///
/// Same failure modes as [`open`], minus the filesystem ones.
pub async fn open_in_memory() -> Result<SqlitePool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(|e| {
            StoreError::ConnectionFailed(format!("Failed to create in-memory database: {e}"))
        })?;

    migrations::run(&pool).await?;

    tracing::debug!("In-memory state database ready");
    Ok(pool)
}
