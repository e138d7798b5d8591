//! CLI command implementations.
//!
//! Every command resolves to a single outcome, so output handling stays
//! flat: [`report`] prints one line of prose or one JSON document
//! depending on the global `--json` flag. Errors travel as
//! `anyhow::Result` up to `main`, which maps them to exit code 1.

pub mod control;
pub mod reset;
pub mod start;
pub mod status;

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use pdsync_core::config::Config;
use pdsync_store::{pool, SqliteStateStore};

use crate::OutputFormat;

/// Print a command's result in the selected format.
pub(crate) fn report(format: OutputFormat, human: &str, json: serde_json::Value) {
    match format {
        OutputFormat::Human => println!("{human}"),
        OutputFormat::Json => println!("{json}"),
    }
}

/// Open the state store at its default location, creating it if needed.
pub(crate) async fn open_store() -> Result<Arc<SqliteStateStore>> {
    let db_path = Config::default_state_db_path();
    let pool = pool::open(&db_path)
        .await
        .context("Failed to open state database")?;
    Ok(Arc::new(SqliteStateStore::new(pool)))
}

/// Open the state store only if it already exists.
///
/// Control commands talk to a running daemon through the database; a
/// missing database means there is nothing to talk to.
pub(crate) async fn open_existing_store() -> Result<Arc<SqliteStateStore>> {
    let db_path = Config::default_state_db_path();
    if !db_path.exists() {
        bail!(
            "No state database at {}. Is the daemon set up? Run 'pdsync start' first.",
            db_path.display()
        );
    }
    open_store().await
}
