//! Control commands - stop, pause, resume
//!
//! Each appends one tag to the durable signal queue; the running daemon's
//! control loop consumes it within a poll tick. The database is the only
//! channel between the CLI and the daemon.

use anyhow::Result;
use clap::Args;

use pdsync_core::domain::signal::ControlSignal;
use pdsync_core::ports::state_store::StateStore;

use crate::OutputFormat;

async fn send(signal: ControlSignal, format: OutputFormat) -> Result<()> {
    let store = super::open_existing_store().await?;
    store.push_signal(signal).await?;
    super::report(
        format,
        &format!("Queued '{signal}' for the running daemon"),
        serde_json::json!({ "queued": signal.as_str() }),
    );
    Ok(())
}

/// Ask the daemon to drain in-flight work and exit.
#[derive(Debug, Args)]
pub struct StopCommand {}

impl StopCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        send(ControlSignal::Stop, format).await
    }
}

/// Ask the daemon to stop claiming new jobs.
#[derive(Debug, Args)]
pub struct PauseCommand {}

impl PauseCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        send(ControlSignal::Pause, format).await
    }
}

/// Undo a previous pause.
#[derive(Debug, Args)]
pub struct ResumeCommand {}

impl ResumeCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        send(ControlSignal::Resume, format).await
    }
}
