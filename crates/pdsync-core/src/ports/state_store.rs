//! State store port (driven/secondary port)
//!
//! The single shared mutable state of the process: change tokens, content
//! hashes, node mappings, the job queue and the signal queue, all behind
//! one handle with transactional semantics.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific and
//!   don't need domain-level classification.
//! - The groupings below are contracts, not suggestions: an implementation
//!   must not split `claim_next_job`, `complete_job`, `fail_job`,
//!   `rename_prefix` or `recover_processing` across transactions.
//! - Enqueueing applies the coalescing rules from
//!   [`crate::domain::job::coalesce`] inside the batch transaction.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::job::{EventKind, NewJob, SyncJob};
use crate::domain::newtypes::{ChangeToken, ContentHash, LocalPath, NodeUid};
use crate::domain::signal::ControlSignal;

// ============================================================================
// Records
// ============================================================================

/// One row of the `node_mapping` table: local path to confirmed remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMappingRecord {
    /// Local path the node mirrors
    pub local_path: LocalPath,
    /// Remote node identifier
    pub node_uid: NodeUid,
    /// Uid of the remote parent folder, when known
    pub parent_uid: Option<NodeUid>,
    /// Whether the remote node is a folder
    pub is_directory: bool,
}

/// Bookkeeping applied atomically with a job's transition to `SYNCED`.
#[derive(Debug, Clone)]
pub enum CompletionEffects {
    /// CREATE/UPDATE success: record mapping, hash and change token.
    Upsert {
        /// Confirmed node mapping
        mapping: NodeMappingRecord,
        /// Hash of the uploaded bytes (None for directories)
        content_hash: Option<ContentHash>,
        /// Post-write change token
        change_token: ChangeToken,
    },
    /// DELETE success: drop every row for the path, and for its subtree
    /// when `subtree` is set.
    Remove {
        /// The deleted path
        path: LocalPath,
        /// Whether descendant rows must be dropped too
        subtree: bool,
    },
    /// RENAME/MOVE success: substitute the path prefix across all three
    /// path-keyed tables.
    Relocate {
        /// Path before the rename
        old_path: LocalPath,
        /// Path after the rename
        new_path: LocalPath,
        /// Whether descendant rows must be rewritten too
        subtree: bool,
        /// New parent uid for the relocated node's mapping row
        new_parent: Option<NodeUid>,
    },
    /// Nothing to record beyond the state flip.
    None,
}

/// How a failed job leaves the claim.
#[derive(Debug, Clone)]
pub enum FailureDisposition {
    /// Back to `PENDING`, eligible again at `retry_at_ms`.
    Retry {
        /// Epoch millis before which the row must not be re-claimed
        retry_at_ms: i64,
        /// Human-readable failure description
        error: String,
        /// Rewrite the job's kind as part of the same transaction
        /// (re-upload escalation to DELETE_AND_CREATE)
        convert_to: Option<EventKind>,
    },
    /// Terminal `BLOCKED`; surfaced by the status interface.
    Block {
        /// Human-readable failure description
        error: String,
    },
}

/// Row counts by job state, for the status interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs waiting (including ones held back by retry timers)
    pub pending: u64,
    /// Jobs currently claimed
    pub processing: u64,
    /// Completed jobs still retained
    pub synced: u64,
    /// Permanently failed jobs
    pub blocked: u64,
}

// ============================================================================
// StateStore trait
// ============================================================================

/// Port trait for the durable state store.
#[async_trait]
pub trait StateStore: Send + Sync {
    // --- file state (change tokens) ---

    /// The full ordered `path -> change token` snapshot, for scan-diff.
    async fn file_state_snapshot(&self) -> anyhow::Result<BTreeMap<String, ChangeToken>>;

    /// Stored change token for one path.
    async fn change_token(&self, path: &LocalPath) -> anyhow::Result<Option<ChangeToken>>;

    /// Record the current change token for a path.
    ///
    /// Also used when a content-identical change is observed: the token
    /// advances even though no job is enqueued.
    async fn upsert_change_token(
        &self,
        path: &LocalPath,
        token: ChangeToken,
    ) -> anyhow::Result<()>;

    // --- hashes and mappings ---

    /// Stored content hash for one path.
    async fn content_hash(&self, path: &LocalPath) -> anyhow::Result<Option<ContentHash>>;

    /// Stored node mapping for one path.
    async fn node_mapping(&self, path: &LocalPath) -> anyhow::Result<Option<NodeMappingRecord>>;

    /// Paths whose stored hash equals `hash`, for rename correlation.
    async fn paths_with_hash(&self, hash: &ContentHash) -> anyhow::Result<Vec<LocalPath>>;

    // --- job queue ---

    /// Persist a classifier batch in one transaction, coalescing each job
    /// into any existing live row for its path. Returns the number of
    /// rows written (inserted or rewritten).
    async fn enqueue_batch(&self, jobs: Vec<NewJob>) -> anyhow::Result<u64>;

    /// Atomically claim the oldest ready job: `PENDING`, `retry_at <= now`,
    /// and no other row for the same path currently `PROCESSING`. The
    /// claimed row is flipped to `PROCESSING` in the same transaction.
    async fn claim_next_job(&self, now_ms: i64) -> anyhow::Result<Option<SyncJob>>;

    /// Flip a claimed job to `SYNCED` and apply its completion effects in
    /// one transaction.
    async fn complete_job(&self, id: i64, effects: CompletionEffects) -> anyhow::Result<()>;

    /// Record a failure: either schedule a retry or block the job, in one
    /// transaction.
    async fn fail_job(&self, id: i64, disposition: FailureDisposition) -> anyhow::Result<()>;

    /// Startup recovery: every `PROCESSING` row back to `PENDING` with
    /// `retry_at = now`. Returns the number of recovered rows.
    async fn recover_processing(&self, now_ms: i64) -> anyhow::Result<u64>;

    /// Delete `SYNCED` rows created before `before_ms`. Returns the number
    /// of pruned rows.
    async fn prune_synced(&self, before_ms: i64) -> anyhow::Result<u64>;

    /// Fetch one job row by id.
    async fn job(&self, id: i64) -> anyhow::Result<Option<SyncJob>>;

    /// All job rows for a path, oldest first.
    async fn jobs_for_path(&self, path: &LocalPath) -> anyhow::Result<Vec<SyncJob>>;

    /// Row counts by state.
    async fn queue_stats(&self) -> anyhow::Result<QueueStats>;

    /// Blocked jobs, newest first.
    async fn blocked_jobs(&self, limit: u32) -> anyhow::Result<Vec<SyncJob>>;

    /// Recently synced jobs, newest first.
    async fn recent_synced(&self, limit: u32) -> anyhow::Result<Vec<SyncJob>>;

    // --- signal queue ---

    /// Append a control signal.
    async fn push_signal(&self, signal: ControlSignal) -> anyhow::Result<()>;

    /// Pop the oldest control signal, if any. Consuming is atomic: a tag
    /// is delivered to exactly one consumer.
    async fn pop_signal(&self) -> anyhow::Result<Option<ControlSignal>>;

    /// Drop all queued signals.
    async fn clear_signals(&self) -> anyhow::Result<()>;

    // --- maintenance ---

    /// Wipe every table (the `reset` command).
    async fn clear_all(&self) -> anyhow::Result<()>;

    /// Set `retry_at = 0` on all pending jobs, making them immediately
    /// eligible. Returns the number of affected rows.
    async fn reset_retry_timers(&self) -> anyhow::Result<u64>;
}
