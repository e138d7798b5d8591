//! Live filesystem watching with write-settle debouncing
//!
//! Wraps the `notify` crate's OS event source. Raw events are reduced to
//! "this path was touched": the settled state of the path on disk, compared
//! against the stored change token, decides what (if anything) the change
//! means. This sidesteps the platform-specific zoo of event kinds; a native
//! rename simply touches both paths, and the classifier re-correlates the
//! pair by content hash.
//!
//! ## Flow
//!
//! ```text
//! inotify ──→ FileWatcher ──→ mpsc ──→ SettleQueue ──→ resolve_settled ──→ Classifier
//! ```
//!
//! A path must stay quiet for the write-settle interval (default 500 ms)
//! before it is resolved. Events whose post-settle token equals the stored
//! token are suppressed, which also silences the initial burst some
//! platforms emit for pre-existing files: the startup scan is authoritative
//! for those.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use pdsync_core::domain::change::FileChange;
use pdsync_core::domain::newtypes::LocalPath;
use pdsync_core::ports::state_store::StateStore;

use crate::exclude::ExcludeSet;
use crate::scan::{token_of, SyncRoot};

/// Default write-settle interval.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

// ============================================================================
// FileWatcher
// ============================================================================

/// Watches sync roots using the OS-native mechanism (inotify on Linux).
///
/// Touched paths are sent through an mpsc channel; debouncing happens
/// downstream in [`SettleQueue`].
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Create a watcher; returns the receiving end of the touched-path
    /// channel.
    pub fn new() -> Result<(Self, mpsc::Receiver<PathBuf>)> {
        let (tx, rx) = mpsc::channel::<PathBuf>(1024);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for path in touched_paths(&event) {
                        if let Err(e) = tx.blocking_send(path) {
                            warn!(error = %e, "Failed to send watcher event (receiver dropped)");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher }, rx))
    }

    /// Start watching a directory tree recursively.
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", path.display()))
    }

    /// Stop watching a directory tree.
    pub fn unwatch(&mut self, path: &Path) -> Result<()> {
        self.watcher
            .unwatch(path)
            .with_context(|| format!("Failed to unwatch path: {}", path.display()))
    }
}

/// Paths an event touches. Access events touch nothing; a rename touches
/// both its endpoints.
fn touched_paths(event: &notify::Event) -> Vec<PathBuf> {
    match &event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
            event.paths.clone()
        }
        _ => Vec::new(),
    }
}

// ============================================================================
// SettleQueue
// ============================================================================

/// Per-path debounce queue.
///
/// Rapid touches to the same path keep extending its quiet window; a path
/// is only released once it has been untouched for the settle interval.
pub struct SettleQueue {
    pending: HashMap<PathBuf, Instant>,
    settle: Duration,
}

impl SettleQueue {
    /// Create a queue with the given settle interval.
    #[must_use]
    pub fn new(settle: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            settle,
        }
    }

    /// Record a touch, resetting the path's quiet window.
    pub fn touch(&mut self, path: PathBuf) {
        self.pending.insert(path, Instant::now());
    }

    /// Paths whose quiet window has elapsed. Released paths are removed.
    pub fn poll(&mut self) -> Vec<PathBuf> {
        let now = Instant::now();
        let settled: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, touched)| now.duration_since(**touched) >= self.settle)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &settled {
            self.pending.remove(path);
        }
        settled
    }

    /// Number of paths still inside their quiet window.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============================================================================
// Settled-path resolution
// ============================================================================

/// Resolve settled paths into change records by comparing the on-disk state
/// against the stored change token.
///
/// Suppresses:
/// - paths outside every sync root or excluded by pattern,
/// - existing paths whose token equals the stored one (spurious event or
///   content already synced),
/// - missing paths that were never tracked.
pub async fn resolve_settled(
    store: &dyn StateStore,
    roots: &[SyncRoot],
    exclude: &ExcludeSet,
    settled: Vec<PathBuf>,
) -> Result<Vec<FileChange>> {
    let mut changes = Vec::new();

    for raw in settled {
        let Ok(path) = LocalPath::new(raw.clone()) else {
            warn!(path = ?raw, "Ignoring non-absolute watcher path");
            continue;
        };
        let Some(root) = roots.iter().find(|r| path.is_under(&r.local)) else {
            debug!(path = %path, "Touched path outside sync roots");
            continue;
        };
        if path == root.local {
            continue;
        }
        let rel = path.relative_to(&root.local)?;
        if exclude.is_excluded(&rel) {
            continue;
        }

        let stored = store.change_token(&path).await?;
        match tokio::fs::metadata(path.as_path()).await {
            Ok(metadata) => {
                if !metadata.is_dir() && !metadata.is_file() {
                    continue;
                }
                let token = token_of(&metadata);
                match stored {
                    Some(prev) if prev == token => {
                        debug!(path = %path, "Settled token unchanged, suppressing");
                    }
                    Some(_) if metadata.is_dir() => {
                        // Known directory, mtime churn only.
                    }
                    stored => {
                        changes.push(FileChange::present(
                            root.local.clone(),
                            path,
                            stored.is_none(),
                            metadata.is_dir(),
                            token,
                        ));
                    }
                }
            }
            Err(_) => {
                if stored.is_some() {
                    changes.push(FileChange::missing(root.local.clone(), path));
                } else {
                    debug!(path = %path, "Untracked path vanished, suppressing");
                }
            }
        }
    }

    Ok(changes)
}

// ============================================================================
// Tests
// ============================================================================
