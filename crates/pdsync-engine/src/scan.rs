//! Scan-and-diff pass
//!
//! Walks each sync root, computes a change token per entry and diffs the
//! result against the stored `file_state` snapshot. Runs at startup (and in
//! `--no-watch` mode it is the only event source). The scan is authoritative
//! for pre-existing files; live events only take over afterwards.
//!
//! Directory entries produce events on creation and deletion only; an
//! mtime change on a directory is not an event.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use pdsync_core::domain::change::FileChange;
use pdsync_core::domain::newtypes::{ChangeToken, LocalPath, RemotePath};

use crate::exclude::ExcludeSet;

/// One configured sync root with its precomputed remote base.
///
/// The remote base is `remote_root` joined with the root directory's base
/// name, so `/home/user/Documents -> /backup` mirrors into
/// `/backup/Documents/...`.
#[derive(Debug, Clone)]
pub struct SyncRoot {
    /// Local directory being mirrored
    pub local: LocalPath,
    /// Remote prefix every path under this root maps into
    pub remote_base: RemotePath,
}

impl SyncRoot {
    /// Build a root from config values, resolving symlinks in the local path.
    pub fn new(source_path: &Path, remote_root: &str) -> Result<Self> {
        let canonical = std::fs::canonicalize(source_path)
            .with_context(|| format!("Sync root does not exist: {}", source_path.display()))?;
        let local = LocalPath::new(canonical)?;
        let base_name = local
            .file_name()
            .context("Sync root has no base name")?;
        let remote_base = RemotePath::new(remote_root.to_string())?.join(&base_name)?;
        Ok(Self { local, remote_base })
    }

    /// Derive the remote path for a local path under this root.
    pub fn remote_path_for(&self, path: &LocalPath) -> Result<RemotePath> {
        let rel = path.relative_to(&self.local)?;
        let mut remote = self.remote_base.clone();
        for component in rel.components() {
            remote = remote.join(&component.as_os_str().to_string_lossy())?;
        }
        Ok(remote)
    }
}

/// Change token from filesystem metadata. Directories record size 0.
#[must_use]
pub fn token_of(metadata: &std::fs::Metadata) -> ChangeToken {
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let size = if metadata.is_dir() { 0 } else { metadata.len() };
    ChangeToken::new(mtime_ms, size)
}

/// Scan one root and diff it against the stored snapshot.
///
/// Emits, in walk order:
/// - `{exists:true, new:true}` for paths absent from the snapshot
///   (directories before their contents),
/// - `{exists:true, new:false}` for files whose token differs,
/// - `{exists:false}` for snapshot entries no longer on disk, topmost
///   first. A missing entry's type is unknown; the processor resolves the
///   ambiguity through the node mapping.
pub async fn scan_root(
    root: &SyncRoot,
    exclude: &ExcludeSet,
    snapshot: &BTreeMap<String, ChangeToken>,
) -> Result<Vec<FileChange>> {
    let mut changes = Vec::new();
    let mut seen = HashSet::new();

    walk(root, &root.local, exclude, snapshot, &mut changes, &mut seen).await?;

    // Snapshot entries under this root that the walk never reached are gone.
    let root_key = root.local.as_key();
    let prefix = format!("{root_key}/");
    for path_key in snapshot.keys() {
        if path_key != &root_key && !path_key.starts_with(&prefix) {
            continue;
        }
        if seen.contains(path_key) {
            continue;
        }
        match LocalPath::new(path_key.into()) {
            Ok(path) => changes.push(FileChange::missing(root.local.clone(), path)),
            Err(e) => warn!(path = %path_key, error = %e, "Skipping corrupt snapshot key"),
        }
    }

    debug!(
        root = %root.local,
        changes = changes.len(),
        "Scan-diff complete"
    );
    Ok(changes)
}

fn walk<'a>(
    root: &'a SyncRoot,
    dir: &'a LocalPath,
    exclude: &'a ExcludeSet,
    snapshot: &'a BTreeMap<String, ChangeToken>,
    changes: &'a mut Vec<FileChange>,
    seen: &'a mut HashSet<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(dir.as_path())
            .await
            .with_context(|| format!("Failed to read directory: {dir}"))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = match LocalPath::new(entry.path()) {
                Ok(p) => p,
                Err(e) => {
                    warn!(path = ?entry.path(), error = %e, "Skipping invalid path");
                    continue;
                }
            };

            let rel = path.relative_to(&root.local)?;
            if exclude.is_excluded(&rel) {
                debug!(path = %path, "Excluded by pattern");
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    // Raced with a concurrent delete; the next scan or a
                    // live event picks it up.
                    warn!(path = %path, error = %e, "Failed to stat entry, skipping");
                    continue;
                }
            };

            let token = token_of(&metadata);
            let key = path.as_key();
            let stored = snapshot.get(&key).copied();
            seen.insert(key);

            if metadata.is_dir() {
                if stored.is_none() {
                    changes.push(FileChange::present(
                        root.local.clone(),
                        path.clone(),
                        true,
                        true,
                        token,
                    ));
                }
                walk(root, &path, exclude, snapshot, changes, seen).await?;
            } else if metadata.is_file() {
                match stored {
                    None => changes.push(FileChange::present(
                        root.local.clone(),
                        path,
                        true,
                        false,
                        token,
                    )),
                    Some(prev) if prev != token => changes.push(FileChange::present(
                        root.local.clone(),
                        path,
                        false,
                        false,
                        token,
                    )),
                    Some(_) => {}
                }
            }
            // Sockets, fifos and other special files are not mirrored.
        }

        Ok(())
    })
}
