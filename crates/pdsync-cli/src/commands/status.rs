//! Status command - inspect the queue
//!
//! Shows row counts by job state, blocked jobs with their last error and
//! retry count, and the most recently completed jobs. In JSON mode the
//! whole report is one document.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::Args;

use pdsync_core::domain::job::SyncJob;
use pdsync_core::ports::state_store::StateStore;

use crate::OutputFormat;

const BLOCKED_LIMIT: u32 = 20;
const RECENT_LIMIT: u32 = 10;

#[derive(Debug, Args)]
pub struct StatusCommand {}

fn job_json(job: &SyncJob) -> serde_json::Value {
    serde_json::json!({
        "id": job.id,
        "kind": job.kind.as_str(),
        "path": job.local_path.as_key(),
        "state": job.state.as_str(),
        "retries": job.n_retries,
        "last_error": job.last_error,
        "created_at": job.created_at,
    })
}

fn created_at_human(job: &SyncJob) -> String {
    Utc.timestamp_millis_opt(job.created_at)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| job.created_at.to_string())
}

impl StatusCommand {
    pub async fn execute(&self, format: OutputFormat) -> Result<()> {
        let store = super::open_existing_store().await?;

        let stats = store.queue_stats().await?;
        let blocked = store.blocked_jobs(BLOCKED_LIMIT).await?;
        let recent = store.recent_synced(RECENT_LIMIT).await?;

        if format == OutputFormat::Json {
            let report = serde_json::json!({
                "queue": {
                    "pending": stats.pending,
                    "processing": stats.processing,
                    "synced": stats.synced,
                    "blocked": stats.blocked,
                },
                "blocked": blocked.iter().map(job_json).collect::<Vec<_>>(),
                "recent": recent.iter().map(job_json).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!(
            "queue: {} pending, {} processing, {} synced, {} blocked",
            stats.pending, stats.processing, stats.synced, stats.blocked
        );

        if !blocked.is_empty() {
            println!();
            println!("blocked jobs:");
            for job in &blocked {
                println!(
                    "  #{} {} {} after {} retries: {}",
                    job.id,
                    job.kind,
                    job.local_path,
                    job.n_retries,
                    job.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        if !recent.is_empty() {
            println!();
            println!("recently synced:");
            for job in &recent {
                println!(
                    "  #{} {} {} at {}",
                    job.id,
                    job.kind,
                    job.local_path,
                    created_at_human(job)
                );
            }
        }

        Ok(())
    }
}
