//! pdsync CLI - Mirror local folders to Proton Drive
//!
//! Provides commands for:
//! - Running the sync daemon (`start`)
//! - Controlling a running daemon via the durable signal queue
//!   (`stop`, `pause`, `resume`)
//! - Clearing local state (`reset`)
//! - Inspecting the queue and blocked jobs (`status`)

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod logging;

use commands::{
    control::{PauseCommand, ResumeCommand, StopCommand},
    reset::ResetCommand,
    start::StartCommand,
    status::StatusCommand,
};

/// How a command renders its result: prose for people, one JSON document
/// for scripts. Selected by the global `--json` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "pdsync", version, about = "Mirror local folders to Proton Drive")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the sync engine
    Start(StartCommand),
    /// Ask a running daemon to stop
    Stop(StopCommand),
    /// Ask a running daemon to stop claiming jobs
    Pause(PauseCommand),
    /// Undo a previous pause
    Resume(ResumeCommand),
    /// Clear local state (all of it, or just signals / retry timers)
    Reset(ResetCommand),
    /// Show queue statistics, blocked jobs and recent activity
    Status(StatusCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };

    match cli.command {
        // `start` initializes logging itself: the rotating file target
        // comes from the configuration it loads first.
        Commands::Start(cmd) => cmd.execute(cli.config, cli.verbose).await,
        Commands::Stop(cmd) => {
            logging::init_console(cli.verbose);
            cmd.execute(format).await
        }
        Commands::Pause(cmd) => {
            logging::init_console(cli.verbose);
            cmd.execute(format).await
        }
        Commands::Resume(cmd) => {
            logging::init_console(cli.verbose);
            cmd.execute(format).await
        }
        Commands::Reset(cmd) => {
            logging::init_console(cli.verbose);
            cmd.execute(format).await
        }
        Commands::Status(cmd) => {
            logging::init_console(cli.verbose);
            cmd.execute(format).await
        }
    }
}
