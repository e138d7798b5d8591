//! Change classification
//!
//! Turns a batch of [`FileChange`] records into typed jobs:
//! - drops content-identical modifications (hash unchanged),
//! - collapses deletions under a deleted ancestor into one subtree delete,
//! - correlates delete+create pairs with matching size and SHA-1 into
//!   RENAME (same parent) or MOVE (different parent) jobs,
//! - derives remote paths from the sync root mapping.
//!
//! The correlation window is the batch itself: the watcher's settle
//! interval groups both halves of a rename into one batch, and the scan
//! pass delivers each root as a single batch, which also correlates moves
//! that happened while the daemon was down.
//!
//! The caller persists the result with one store transaction per batch.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use pdsync_core::domain::change::FileChange;
use pdsync_core::domain::job::{EventKind, NewJob};
use pdsync_core::domain::newtypes::{ChangeToken, ContentHash, LocalPath};
use pdsync_core::ports::state_store::StateStore;

use crate::hash::compute_sha1;
use crate::scan::SyncRoot;

/// Output of classifying one batch.
#[derive(Debug, Default)]
pub struct Classification {
    /// Jobs to enqueue, in order
    pub jobs: Vec<NewJob>,
    /// Paths whose bytes are unchanged but whose token advanced; recorded
    /// without a job
    pub unchanged_tokens: Vec<(LocalPath, ChangeToken)>,
}

impl Classification {
    /// Whether the batch produced nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.unchanged_tokens.is_empty()
    }
}

/// Turns watcher batches into jobs, consulting stored hashes and mappings.
pub struct Classifier {
    store: Arc<dyn StateStore>,
    roots: Vec<SyncRoot>,
}

impl Classifier {
    /// Create a classifier over the configured sync roots.
    pub fn new(store: Arc<dyn StateStore>, roots: Vec<SyncRoot>) -> Self {
        Self { store, roots }
    }

    fn root_for(&self, change: &FileChange) -> Option<&SyncRoot> {
        self.roots.iter().find(|r| r.local == change.root)
    }

    /// Classify one batch of changes into jobs.
    pub async fn classify(&self, changes: Vec<FileChange>) -> Result<Classification> {
        let mut out = Classification::default();

        // Split the batch; deletions sorted by path so ancestors come first.
        let mut deletions: Vec<FileChange> = Vec::new();
        let mut presents: Vec<FileChange> = Vec::new();
        for change in changes {
            if change.exists {
                presents.push(change);
            } else {
                deletions.push(change);
            }
        }
        deletions.sort_by(|a, b| a.path.cmp(&b.path));

        // A deleted ancestor owns its subtree: one DELETE job covers it.
        let mut kept_deletions: Vec<FileChange> = Vec::new();
        for deletion in deletions {
            let covered = kept_deletions
                .iter()
                .any(|kept| deletion.path.is_under(&kept.path) && deletion.path != kept.path);
            if covered {
                debug!(path = %deletion.path, "Deletion covered by ancestor");
            } else {
                kept_deletions.push(deletion);
            }
        }

        // New files are rename candidates until matched or classified.
        let mut create_candidates: Vec<FileChange> = Vec::new();

        for change in presents {
            let Some(root) = self.root_for(&change) else {
                warn!(path = %change.path, "Change outside any sync root, dropping");
                continue;
            };
            let Some(token) = change.token else {
                warn!(path = %change.path, "Present change without a token, dropping");
                continue;
            };

            if change.is_directory {
                if change.is_new {
                    let mut job = NewJob::new(
                        EventKind::Create,
                        change.path.clone(),
                        root.remote_path_for(&change.path)?,
                    );
                    job.is_directory = true;
                    job.observed_token = Some(token);
                    out.jobs.push(job);
                }
                continue;
            }

            if change.is_new {
                create_candidates.push(change);
                continue;
            }

            // Modified file: the token differs, but the bytes may not.
            let current = match compute_sha1(change.path.as_path()).await {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(path = %change.path, error = %e, "File vanished during hashing");
                    continue;
                }
            };
            let stored = self.store.content_hash(&change.path).await?;
            if stored.as_ref() == Some(&current) {
                debug!(path = %change.path, "Content unchanged, advancing token only");
                out.unchanged_tokens.push((change.path, token));
                continue;
            }

            let mut job = NewJob::new(
                EventKind::Update,
                change.path.clone(),
                root.remote_path_for(&change.path)?,
            );
            job.content_hash = Some(current);
            job.observed_token = Some(token);
            out.jobs.push(job);
        }

        // Correlate deletions with created files of identical size and hash.
        let mut hash_cache: HashMap<LocalPath, Option<ContentHash>> = HashMap::new();
        for deletion in kept_deletions {
            match self
                .correlate(&deletion, &mut create_candidates, &mut hash_cache)
                .await?
            {
                Some(job) => out.jobs.push(job),
                None => {
                    let Some(root) = self.root_for(&deletion) else {
                        warn!(path = %deletion.path, "Deletion outside any sync root, dropping");
                        continue;
                    };
                    let remote = root.remote_path_for(&deletion.path)?;
                    let mut job =
                        NewJob::new(EventKind::Delete, deletion.path.clone(), remote.clone());
                    job.old_remote_path = Some(remote);
                    out.jobs.push(job);
                }
            }
        }

        // Whatever was not matched is a genuine create.
        for change in create_candidates {
            let Some(root) = self.root_for(&change) else {
                continue;
            };
            let mut job = NewJob::new(
                EventKind::Create,
                change.path.clone(),
                root.remote_path_for(&change.path)?,
            );
            job.content_hash = hash_cache.get(&change.path).cloned().flatten();
            job.observed_token = change.token;
            out.jobs.push(job);
        }

        Ok(out)
    }

    /// Try to match a deletion against one of the batch's new files.
    ///
    /// A match needs the deleted path's stored hash and size to equal the
    /// created file's current ones. Matching consumes the candidate.
    async fn correlate(
        &self,
        deletion: &FileChange,
        candidates: &mut Vec<FileChange>,
        hash_cache: &mut HashMap<LocalPath, Option<ContentHash>>,
    ) -> Result<Option<NewJob>> {
        let Some(old_hash) = self.store.content_hash(&deletion.path).await? else {
            return Ok(None);
        };
        let Some(old_token) = self.store.change_token(&deletion.path).await? else {
            return Ok(None);
        };

        let mut matched: Option<usize> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            if candidate.is_directory || candidate.size() != Some(old_token.size) {
                continue;
            }
            let hash = match hash_cache.get(&candidate.path) {
                Some(cached) => cached.clone(),
                None => {
                    let computed = compute_sha1(candidate.path.as_path()).await.ok();
                    hash_cache.insert(candidate.path.clone(), computed.clone());
                    computed
                }
            };
            if hash.as_ref() == Some(&old_hash) {
                matched = Some(i);
                break;
            }
        }

        let Some(index) = matched else {
            return Ok(None);
        };
        let candidate = candidates.remove(index);

        let Some(old_root) = self.root_for(deletion) else {
            return Ok(None);
        };
        let Some(new_root) = self.root_for(&candidate) else {
            return Ok(None);
        };

        let same_parent = deletion.path.parent() == candidate.path.parent();
        let kind = if same_parent {
            EventKind::Rename
        } else {
            EventKind::Move
        };
        debug!(
            old = %deletion.path,
            new = %candidate.path,
            kind = %kind,
            "Correlated delete+create"
        );

        let mut job = NewJob::new(
            kind,
            candidate.path.clone(),
            new_root.remote_path_for(&candidate.path)?,
        );
        job.old_local_path = Some(deletion.path.clone());
        job.old_remote_path = Some(old_root.remote_path_for(&deletion.path)?);
        job.content_hash = Some(old_hash);
        job.observed_token = candidate.token;
        Ok(Some(job))
    }
}
