//! Reset command - clear local state
//!
//! By default wipes every table (tracked files, hashes, mappings, jobs and
//! signals); the flags narrow the reset to the signal queue or to pending
//! jobs' retry timers.

use anyhow::Result;
use clap::Args;

use pdsync_core::ports::state_store::StateStore;

use crate::OutputFormat;

#[derive(Debug, Args)]
pub struct ResetCommand {
    /// Only clear the control signal queue
    #[arg(long)]
    signals: bool,

    /// Only make pending jobs immediately eligible again
    #[arg(long)]
    retry_timers: bool,
}

impl ResetCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let store = super::open_existing_store().await?;

        if self.signals {
            store.clear_signals().await?;
            super::report(
                format,
                "Signal queue cleared",
                serde_json::json!({ "cleared": "signals" }),
            );
            return Ok(());
        }
        if self.retry_timers {
            let reset = store.reset_retry_timers().await?;
            super::report(
                format,
                &format!("Reset retry timers on {reset} pending jobs"),
                serde_json::json!({ "cleared": "retry_timers", "jobs": reset }),
            );
            return Ok(());
        }

        store.clear_all().await?;
        super::report(
            format,
            "State store cleared; the next start performs a full scan",
            serde_json::json!({ "cleared": "all" }),
        );
        Ok(())
    }
}
