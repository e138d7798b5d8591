//! Durable sync jobs and the enqueue coalescing rules
//!
//! A [`SyncJob`] is one intended remote operation on one local path,
//! persisted as a row in the job queue. Jobs move through
//! `PENDING -> PROCESSING -> {SYNCED | BLOCKED | PENDING-retry}`.
//!
//! [`coalesce`] merges an incoming event into an existing non-synced job
//! for the same path, keeping the queue's invariant of (at most) one live
//! row per path. The single documented exception is a pending rename
//! followed by an update, which stays a separate row; the claim query
//! preserves per-path serialization in that case.

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ChangeToken, ContentHash, LocalPath, RemotePath};

// ============================================================================
// EventKind
// ============================================================================

/// The remote operation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// New file or directory to create remotely
    Create,
    /// Existing file whose content changed
    Update,
    /// File or directory removed locally
    Delete,
    /// Same directory, new name
    Rename,
    /// Different parent directory (name may also change)
    Move,
    /// Remote object must be replaced wholesale: delete old, create new
    DeleteAndCreate,
}

impl EventKind {
    /// Stored tag for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "CREATE",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
            EventKind::Rename => "RENAME",
            EventKind::Move => "MOVE",
            EventKind::DeleteAndCreate => "DELETE_AND_CREATE",
        }
    }

    /// Parse a stored tag. Unknown tags are rejected at the persistence
    /// boundary.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "CREATE" => Ok(EventKind::Create),
            "UPDATE" => Ok(EventKind::Update),
            "DELETE" => Ok(EventKind::Delete),
            "RENAME" => Ok(EventKind::Rename),
            "MOVE" => Ok(EventKind::Move),
            "DELETE_AND_CREATE" => Ok(EventKind::DeleteAndCreate),
            other => Err(DomainError::UnknownVariant {
                what: "event kind",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// JobState
// ============================================================================

/// Queue state of a job row.
///
/// `Synced` and `Blocked` are terminal. A `Processing` row found at startup
/// is reset to `Pending` by recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting to be claimed (retry_at may hold it back)
    Pending,
    /// Claimed by a processor task
    Processing,
    /// Completed successfully
    Synced,
    /// Permanently failed; surfaced to the operator
    Blocked,
}

impl JobState {
    /// Stored tag for this state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Processing => "PROCESSING",
            JobState::Synced => "SYNCED",
            JobState::Blocked => "BLOCKED",
        }
    }

    /// Parse a stored tag.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "PROCESSING" => Ok(JobState::Processing),
            "SYNCED" => Ok(JobState::Synced),
            "BLOCKED" => Ok(JobState::Blocked),
            other => Err(DomainError::UnknownVariant {
                what: "job state",
                value: other.to_string(),
            }),
        }
    }

    /// Whether the row will never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Synced | JobState::Blocked)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SyncJob / NewJob
// ============================================================================

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    /// Monotonic row id
    pub id: i64,
    /// Operation to perform
    pub kind: EventKind,
    /// Target local path (the new path for renames/moves)
    pub local_path: LocalPath,
    /// Target remote path
    pub remote_path: RemotePath,
    /// Previous local path for renames/moves
    pub old_local_path: Option<LocalPath>,
    /// Previous remote path for renames/moves/deletes
    pub old_remote_path: Option<RemotePath>,
    /// SHA-1 of the local bytes, when known at classification time
    pub content_hash: Option<ContentHash>,
    /// Queue state
    pub state: JobState,
    /// Retry attempts so far
    pub n_retries: u32,
    /// Epoch millis before which the row must not be claimed (0 = ready)
    pub retry_at: i64,
    /// Message from the most recent failure
    pub last_error: Option<String>,
    /// Epoch millis at enqueue time
    pub created_at: i64,
}

/// A job as produced by the classifier, before it has a row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Operation to perform
    pub kind: EventKind,
    /// Target local path
    pub local_path: LocalPath,
    /// Target remote path
    pub remote_path: RemotePath,
    /// Previous local path for renames/moves
    pub old_local_path: Option<LocalPath>,
    /// Previous remote path for renames/moves/deletes
    pub old_remote_path: Option<RemotePath>,
    /// SHA-1 of the local bytes, when known
    pub content_hash: Option<ContentHash>,
    /// Whether the target is a directory
    pub is_directory: bool,
    /// Change token observed when the event was classified. Persisted into
    /// `file_state` in the same transaction as the job row; deletions clear
    /// the row instead.
    pub observed_token: Option<ChangeToken>,
}

impl NewJob {
    /// Convenience constructor for the common single-path case.
    #[must_use]
    pub fn new(kind: EventKind, local_path: LocalPath, remote_path: RemotePath) -> Self {
        Self {
            kind,
            local_path,
            remote_path,
            old_local_path: None,
            old_remote_path: None,
            content_hash: None,
            is_directory: false,
            observed_token: None,
        }
    }
}

// ============================================================================
// Coalescing
// ============================================================================

/// Outcome of merging an incoming job into an existing live row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coalesced {
    /// Rewrite the existing row with this kind/hash (row id and position
    /// in the queue are kept, so retries preserve ordering).
    Replace {
        /// New kind for the row
        kind: EventKind,
        /// New content hash for the row (None clears it)
        content_hash: Option<ContentHash>,
    },
    /// The incoming event carries no new information; drop it.
    Drop,
    /// The incoming job must be inserted as its own row.
    InsertSeparate,
}

/// Merge `incoming` into an existing non-synced job for the same path.
///
/// Implements the enqueue coalescing table:
///
/// | existing | incoming | result |
/// |---|---|---|
/// | CREATE | UPDATE | CREATE (latest hash) |
/// | UPDATE | UPDATE | UPDATE (latest hash) |
/// | any | DELETE | DELETE |
/// | RENAME/MOVE | UPDATE | kept separate |
/// | DELETE | CREATE | DELETE_AND_CREATE |
/// | same kind | same kind | latest wins |
#[must_use]
pub fn coalesce(existing: EventKind, incoming: &NewJob) -> Coalesced {
    match (existing, incoming.kind) {
        // A pending create absorbs content updates: the eventual upload
        // reads the file's bytes at execution time anyway.
        (EventKind::Create, EventKind::Update) => Coalesced::Replace {
            kind: EventKind::Create,
            content_hash: incoming.content_hash.clone(),
        },
        (EventKind::Update, EventKind::Update) => Coalesced::Replace {
            kind: EventKind::Update,
            content_hash: incoming.content_hash.clone(),
        },
        (EventKind::DeleteAndCreate, EventKind::Update) => Coalesced::Replace {
            kind: EventKind::DeleteAndCreate,
            content_hash: incoming.content_hash.clone(),
        },
        // A rename must still execute against the remote node; the content
        // update is queued behind it as its own row.
        (EventKind::Rename | EventKind::Move, EventKind::Update) => Coalesced::InsertSeparate,
        // Deletion supersedes whatever was pending for the path.
        (_, EventKind::Delete) => Coalesced::Replace {
            kind: EventKind::Delete,
            content_hash: None,
        },
        // The path was deleted and recreated before the delete ran: the
        // remote node must be replaced, not revised.
        (EventKind::Delete, EventKind::Create) => Coalesced::Replace {
            kind: EventKind::DeleteAndCreate,
            content_hash: incoming.content_hash.clone(),
        },
        // Duplicate observation of the same intent: latest wins.
        (a, b) if a == b => Coalesced::Replace {
            kind: b,
            content_hash: incoming.content_hash.clone(),
        },
        _ => Coalesced::InsertSeparate,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn job(kind: EventKind) -> NewJob {
        NewJob::new(
            kind,
            LocalPath::new(PathBuf::from("/root/a.txt")).unwrap(),
            RemotePath::new("/root/a.txt".to_string()).unwrap(),
        )
    }

    fn job_with_hash(kind: EventKind, hash: &str) -> NewJob {
        let mut j = job(kind);
        j.content_hash = Some(ContentHash::new(hash.repeat(40)).unwrap());
        j
    }

    #[test]
    fn test_event_kind_roundtrip() {
        for kind in [
            EventKind::Create,
            EventKind::Update,
            EventKind::Delete,
            EventKind::Rename,
            EventKind::Move,
            EventKind::DeleteAndCreate,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn test_event_kind_unknown_rejected() {
        assert!(EventKind::parse("TRUNCATE").is_err());
        assert!(EventKind::parse("create").is_err());
    }

    #[test]
    fn test_job_state_roundtrip() {
        for state in [
            JobState::Pending,
            JobState::Processing,
            JobState::Synced,
            JobState::Blocked,
        ] {
            assert_eq!(JobState::parse(state.as_str()).unwrap(), state);
        }
        assert!(JobState::parse("RUNNING").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Synced.is_terminal());
        assert!(JobState::Blocked.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Processing.is_terminal());
    }

    #[test]
    fn test_coalesce_create_then_update_stays_create() {
        let incoming = job_with_hash(EventKind::Update, "a");
        let result = coalesce(EventKind::Create, &incoming);
        assert_eq!(
            result,
            Coalesced::Replace {
                kind: EventKind::Create,
                content_hash: incoming.content_hash.clone(),
            }
        );
    }

    #[test]
    fn test_coalesce_update_update_latest_hash_wins() {
        let incoming = job_with_hash(EventKind::Update, "b");
        let result = coalesce(EventKind::Update, &incoming);
        assert_eq!(
            result,
            Coalesced::Replace {
                kind: EventKind::Update,
                content_hash: incoming.content_hash.clone(),
            }
        );
    }

    #[test]
    fn test_coalesce_anything_then_delete_is_delete() {
        for existing in [
            EventKind::Create,
            EventKind::Update,
            EventKind::Rename,
            EventKind::Move,
            EventKind::DeleteAndCreate,
        ] {
            let result = coalesce(existing, &job(EventKind::Delete));
            assert_eq!(
                result,
                Coalesced::Replace {
                    kind: EventKind::Delete,
                    content_hash: None,
                }
            );
        }
    }

    #[test]
    fn test_coalesce_delete_then_create_becomes_replace() {
        let incoming = job_with_hash(EventKind::Create, "c");
        let result = coalesce(EventKind::Delete, &incoming);
        assert_eq!(
            result,
            Coalesced::Replace {
                kind: EventKind::DeleteAndCreate,
                content_hash: incoming.content_hash.clone(),
            }
        );
    }

    #[test]
    fn test_coalesce_rename_then_update_kept_separate() {
        let incoming = job_with_hash(EventKind::Update, "d");
        assert_eq!(coalesce(EventKind::Rename, &incoming), Coalesced::InsertSeparate);
        assert_eq!(coalesce(EventKind::Move, &incoming), Coalesced::InsertSeparate);
    }
}
