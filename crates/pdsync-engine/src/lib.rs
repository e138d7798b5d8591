//! pdsync Engine - One-way mirror of local directories to a remote drive
//!
//! Provides the moving parts of the sync pipeline:
//! - [`scan`] - startup scan-and-diff against the stored change tokens
//! - [`watcher`] - live filesystem events with write-settle debouncing
//! - [`classifier`] - semantic change events, rename/move correlation,
//!   enqueue coalescing
//! - [`queue`] - error classification and retry backoff policy
//! - [`processor`] - bounded task pool executing jobs against the drive
//! - [`engine`] - wiring, control signals, pause/resume, shutdown

pub mod classifier;
pub mod engine;
pub mod exclude;
pub mod hash;
pub mod processor;
pub mod queue;
pub mod scan;
pub mod watcher;

pub use engine::{Engine, EngineOptions};

/// Epoch milliseconds now. The single clock the engine schedules against.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
