//! Tracing setup
//!
//! Console logging is filtered by verbosity flags (overridable via
//! `RUST_LOG`). In daemon mode a second layer writes to a size-rotated
//! file: when the active file exceeds its size budget it is shifted to
//! `<name>.1`, `<name>.2`, ..., keeping `max_files` files in total.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use pdsync_core::config::LoggingConfig;

fn env_filter(verbose: u8, config_level: Option<&str>) -> EnvFilter {
    let fallback = match verbose {
        0 => config_level.unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Console-only logging, for the short-lived control commands.
pub fn init_console(verbose: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose, None))
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Console plus rotating-file logging, for `start`.
pub fn init_daemon(verbose: u8, logging: &LoggingConfig) -> Result<()> {
    let file_layer = match &logging.file {
        Some(path) => {
            let writer = RotatingWriter::open(
                path.clone(),
                logging.max_size_mib * 1024 * 1024,
                logging.max_files,
            )?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter(verbose, Some(&logging.level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .with(file_layer)
        .init();
    Ok(())
}

// ============================================================================
// Size-based rotation
// ============================================================================

struct RotatingState {
    file: File,
    written: u64,
}

/// `io::Write` that rotates the target file once it exceeds `max_size`.
#[derive(Clone)]
pub struct RotatingWriter {
    path: PathBuf,
    max_size: u64,
    max_files: u32,
    state: Arc<Mutex<RotatingState>>,
}

impl RotatingWriter {
    fn open(path: PathBuf, max_size: u64, max_files: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            max_files: max_files.max(1),
            state: Arc::new(Mutex::new(RotatingState { file, written })),
        })
    }

    fn rotated_name(&self, index: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&self, state: &mut RotatingState) -> io::Result<()> {
        state.file.flush()?;

        // Shift the retained files up, dropping the oldest.
        for index in (1..self.max_files).rev() {
            let from = if index == 1 {
                self.path.clone()
            } else {
                self.rotated_name(index - 1)
            };
            let to = self.rotated_name(index);
            if from.exists() {
                std::fs::rename(&from, &to)?;
            }
        }
        if self.max_files == 1 {
            std::fs::remove_file(&self.path)?;
        }

        state.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        state.written = 0;
        Ok(())
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().expect("log writer lock poisoned");
        if state.written + buf.len() as u64 > self.max_size {
            self.rotate(&mut state)?;
        }
        let n = state.file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().expect("log writer lock poisoned");
        state.file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
