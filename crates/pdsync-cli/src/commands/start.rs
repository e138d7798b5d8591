//! Start command - run the sync engine
//!
//! Loads and validates the configuration, initializes daemon logging
//! (console plus rotating file), opens the state store, selects the drive
//! backend and runs the engine until a `stop` signal or SIGINT/SIGTERM.
//!
//! Exit codes: 0 on a clean stop, 1 on any startup failure.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pdsync_core::config::Config;
use pdsync_core::ports::auth_provider::AuthProvider;
use pdsync_core::ports::state_store::StateStore;
use pdsync_drive_local::LocalDirAuthProvider;
use pdsync_engine::{Engine, EngineOptions};

use crate::logging;

#[derive(Debug, Args)]
pub struct StartCommand {
    /// Run the startup scan only; skip live watching
    #[arg(long)]
    no_watch: bool,

    /// Plan jobs but write nothing, locally or remotely
    #[arg(long)]
    dry_run: bool,

    /// Start with job claiming paused
    #[arg(long)]
    paused: bool,
}

impl StartCommand {
    pub async fn execute(&self, config_path: Option<PathBuf>, verbose: u8) -> Result<()> {
        let config_path = config_path.unwrap_or_else(Config::default_path);
        let config = Config::load(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

        let problems = config.validate();
        if !problems.is_empty() {
            for p in &problems {
                eprintln!("config error: {p}");
            }
            bail!("Invalid configuration ({} problems)", problems.len());
        }

        logging::init_daemon(verbose, &config.logging)?;
        info!(config = %config_path.display(), "pdsync starting");

        let store = super::open_store().await?;
        let auth: Arc<dyn AuthProvider> = match &config.local_drive_path {
            Some(path) => Arc::new(LocalDirAuthProvider::new(path.clone())),
            None => bail!(
                "No drive backend configured. Set `local_drive_path` to mirror \
                 into a local directory."
            ),
        };

        let options = EngineOptions {
            watch: !self.no_watch,
            dry_run: self.dry_run,
            start_paused: self.paused,
        };

        let engine = Engine::new(
            config,
            Some(config_path),
            store as Arc<dyn StateStore>,
            auth,
            options,
        );

        // OS signals feed the same shutdown path as the durable `stop` tag.
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal(signal_token).await;
        });

        let result = engine.run(shutdown).await;
        match &result {
            Ok(()) => info!("pdsync stopped cleanly"),
            Err(e) => error!(error = %e, "pdsync exiting with error"),
        }
        result
    }
}

/// Wait for SIGTERM or SIGINT and trigger the cancellation token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}
