//! SQLite implementation of the StateStore port
//!
//! All transactional groupings the sync engine relies on live here:
//! claiming a job, completing it together with its bookkeeping, recording
//! failures, rewriting directory prefixes and startup recovery each happen
//! inside a single transaction.
//!
//! ## Type Mapping
//!
//! | Domain Type   | SQL Type | Strategy                                  |
//! |---------------|----------|-------------------------------------------|
//! | LocalPath     | TEXT     | lossy UTF-8 key via `.as_key()`           |
//! | RemotePath    | TEXT     | `.as_str()` / `RemotePath::new()`         |
//! | NodeUid       | TEXT     | `.as_str()` / `NodeUid::new()`            |
//! | ContentHash   | TEXT     | lowercase hex via `.as_str()`             |
//! | ChangeToken   | TEXT     | `"<mtime_ms>:<size>"` via Display/FromStr |
//! | EventKind     | TEXT     | uppercase tag, unknown tags rejected      |
//! | JobState      | TEXT     | uppercase tag, unknown tags rejected      |
//! | ControlSignal | TEXT     | lowercase tag, unknown tags rejected      |
//!
//! Subtree queries compare string prefixes with
//! `substr(local_path, 1, length(?) + 1) = ? || '/'` so glob/LIKE
//! metacharacters in paths cannot widen the match.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use pdsync_core::domain::job::{coalesce, Coalesced, EventKind, JobState, NewJob, SyncJob};
use pdsync_core::domain::newtypes::{ChangeToken, ContentHash, LocalPath, NodeUid, RemotePath};
use pdsync_core::domain::signal::ControlSignal;
use pdsync_core::ports::state_store::{
    CompletionEffects, FailureDisposition, NodeMappingRecord, QueueStats, StateStore,
};

use crate::StoreError;

/// SQLite-based implementation of the state store port.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Creates a new store instance with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Row mapping
// ============================================================================

fn local_path_from(s: String) -> Result<LocalPath, StoreError> {
    LocalPath::new(PathBuf::from(&s))
        .map_err(|e| StoreError::CorruptRow(format!("local path '{s}': {e}")))
}

fn job_from_row(row: &SqliteRow) -> Result<SyncJob, StoreError> {
    let id: i64 = row.get("id");
    let event_type: String = row.get("event_type");
    let local_path: String = row.get("local_path");
    let remote_path: String = row.get("remote_path");
    let old_local_path: Option<String> = row.get("old_local_path");
    let old_remote_path: Option<String> = row.get("old_remote_path");
    let content_hash: Option<String> = row.get("content_hash");
    let state: String = row.get("state");
    let n_retries: i64 = row.get("n_retries");
    let retry_at: i64 = row.get("retry_at");
    let last_error: Option<String> = row.get("last_error");
    let created_at: i64 = row.get("created_at");

    let kind = EventKind::parse(&event_type)
        .map_err(|e| StoreError::CorruptRow(format!("job {id}: {e}")))?;
    let state = JobState::parse(&state)
        .map_err(|e| StoreError::CorruptRow(format!("job {id}: {e}")))?;

    let remote_path = RemotePath::new(remote_path)
        .map_err(|e| StoreError::CorruptRow(format!("job {id}: {e}")))?;
    let old_remote_path = old_remote_path
        .map(RemotePath::new)
        .transpose()
        .map_err(|e| StoreError::CorruptRow(format!("job {id}: {e}")))?;
    let content_hash = content_hash
        .map(ContentHash::new)
        .transpose()
        .map_err(|e| StoreError::CorruptRow(format!("job {id}: {e}")))?;

    Ok(SyncJob {
        id,
        kind,
        local_path: local_path_from(local_path)?,
        remote_path,
        old_local_path: old_local_path.map(local_path_from).transpose()?,
        old_remote_path,
        content_hash,
        state,
        n_retries: n_retries as u32,
        retry_at,
        last_error,
        created_at,
    })
}

fn mapping_from_row(row: &SqliteRow) -> Result<NodeMappingRecord, StoreError> {
    let local_path: String = row.get("local_path");
    let node_uid: String = row.get("node_uid");
    let parent_node_uid: Option<String> = row.get("parent_node_uid");
    let is_directory: i64 = row.get("is_directory");

    let node_uid = NodeUid::new(node_uid)
        .map_err(|e| StoreError::CorruptRow(format!("node mapping: {e}")))?;
    let parent_uid = parent_node_uid
        .map(NodeUid::new)
        .transpose()
        .map_err(|e| StoreError::CorruptRow(format!("node mapping: {e}")))?;

    Ok(NodeMappingRecord {
        local_path: local_path_from(local_path)?,
        node_uid,
        parent_uid,
        is_directory: is_directory != 0,
    })
}

// ============================================================================
// Subtree helpers
// ============================================================================

/// Tables keyed by `local_path` that subtree operations touch together.
const PATH_TABLES: &[&str] = &["file_state", "file_hashes", "node_mapping"];

async fn remove_path_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    path: &str,
    subtree: bool,
) -> Result<(), sqlx::Error> {
    for table in PATH_TABLES {
        sqlx::query(&format!("DELETE FROM {table} WHERE local_path = ?1"))
            .bind(path)
            .execute(&mut **tx)
            .await?;
        if subtree {
            sqlx::query(&format!(
                "DELETE FROM {table} \
                 WHERE substr(local_path, 1, length(?1) + 1) = ?1 || '/'"
            ))
            .bind(path)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn relocate_path_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    old_path: &str,
    new_path: &str,
    subtree: bool,
) -> Result<(), sqlx::Error> {
    for table in PATH_TABLES {
        sqlx::query(&format!(
            "UPDATE {table} SET local_path = ?2 WHERE local_path = ?1"
        ))
        .bind(old_path)
        .bind(new_path)
        .execute(&mut **tx)
        .await?;
        if subtree {
            sqlx::query(&format!(
                "UPDATE {table} \
                 SET local_path = ?2 || substr(local_path, length(?1) + 1) \
                 WHERE substr(local_path, 1, length(?1) + 1) = ?1 || '/'"
            ))
            .bind(old_path)
            .bind(new_path)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

// ============================================================================
// StateStore implementation
// ============================================================================

#[async_trait]
impl StateStore for SqliteStateStore {
    // --- file state ---

    async fn file_state_snapshot(&self) -> anyhow::Result<BTreeMap<String, ChangeToken>> {
        let rows = sqlx::query("SELECT local_path, change_token FROM file_state")
            .fetch_all(&self.pool)
            .await?;

        let mut snapshot = BTreeMap::new();
        for row in rows {
            let path: String = row.get("local_path");
            let token: String = row.get("change_token");
            let token: ChangeToken = token
                .parse()
                .map_err(|e| StoreError::CorruptRow(format!("change token for {path}: {e}")))?;
            snapshot.insert(path, token);
        }
        Ok(snapshot)
    }

    async fn change_token(&self, path: &LocalPath) -> anyhow::Result<Option<ChangeToken>> {
        let row = sqlx::query("SELECT change_token FROM file_state WHERE local_path = ?1")
            .bind(path.as_key())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let token: String = row.get("change_token");
                let token: ChangeToken = token
                    .parse()
                    .map_err(|e| StoreError::CorruptRow(format!("change token: {e}")))?;
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    async fn upsert_change_token(
        &self,
        path: &LocalPath,
        token: ChangeToken,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO file_state (local_path, change_token) VALUES (?1, ?2) \
             ON CONFLICT(local_path) DO UPDATE SET change_token = excluded.change_token",
        )
        .bind(path.as_key())
        .bind(token.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- hashes and mappings ---

    async fn content_hash(&self, path: &LocalPath) -> anyhow::Result<Option<ContentHash>> {
        let row = sqlx::query("SELECT content_hash FROM file_hashes WHERE local_path = ?1")
            .bind(path.as_key())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let hash: String = row.get("content_hash");
                let hash = ContentHash::new(hash)
                    .map_err(|e| StoreError::CorruptRow(format!("content hash: {e}")))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    async fn node_mapping(&self, path: &LocalPath) -> anyhow::Result<Option<NodeMappingRecord>> {
        let row = sqlx::query(
            "SELECT local_path, node_uid, parent_node_uid, is_directory \
             FROM node_mapping WHERE local_path = ?1",
        )
        .bind(path.as_key())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| mapping_from_row(&r)).transpose().map_err(Into::into)
    }

    async fn paths_with_hash(&self, hash: &ContentHash) -> anyhow::Result<Vec<LocalPath>> {
        let rows = sqlx::query("SELECT local_path FROM file_hashes WHERE content_hash = ?1")
            .bind(hash.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| local_path_from(r.get("local_path")).map_err(Into::into))
            .collect()
    }

    // --- job queue ---

    async fn enqueue_batch(&self, jobs: Vec<NewJob>) -> anyhow::Result<u64> {
        let created_at = now_ms();
        let mut written = 0u64;
        let mut tx = self.pool.begin().await?;

        for job in jobs {
            // Observation-time bookkeeping: the change token advances (or
            // disappears) with the job row, in the same transaction.
            match (&job.observed_token, job.kind) {
                (_, EventKind::Delete) => {
                    sqlx::query("DELETE FROM file_state WHERE local_path = ?1")
                        .bind(job.local_path.as_key())
                        .execute(&mut *tx)
                        .await?;
                }
                (Some(token), _) => {
                    sqlx::query(
                        "INSERT INTO file_state (local_path, change_token) VALUES (?1, ?2) \
                         ON CONFLICT(local_path) DO UPDATE SET \
                             change_token = excluded.change_token",
                    )
                    .bind(job.local_path.as_key())
                    .bind(token.to_string())
                    .execute(&mut *tx)
                    .await?;
                }
                (None, _) => {}
            }
            if matches!(job.kind, EventKind::Rename | EventKind::Move) {
                if let Some(old) = &job.old_local_path {
                    sqlx::query("DELETE FROM file_state WHERE local_path = ?1")
                        .bind(old.as_key())
                        .execute(&mut *tx)
                        .await?;
                }
            }

            // Coalesce into a live pending row for the path, if one exists.
            let existing = sqlx::query(
                "SELECT id, event_type FROM sync_jobs \
                 WHERE local_path = ?1 AND state = 'PENDING' \
                 ORDER BY id DESC LIMIT 1",
            )
            .bind(job.local_path.as_key())
            .fetch_optional(&mut *tx)
            .await?;

            let action = match &existing {
                Some(row) => {
                    let kind_tag: String = row.get("event_type");
                    let kind = EventKind::parse(&kind_tag)
                        .map_err(|e| StoreError::CorruptRow(e.to_string()))?;
                    coalesce(kind, &job)
                }
                None => Coalesced::InsertSeparate,
            };

            match action {
                Coalesced::Drop => {}
                Coalesced::Replace { kind, content_hash } => {
                    let id: i64 = existing.expect("replace requires an existing row").get("id");
                    sqlx::query(
                        "UPDATE sync_jobs SET \
                             event_type = ?2, \
                             remote_path = ?3, \
                             content_hash = ?4, \
                             old_local_path = COALESCE(?5, old_local_path), \
                             old_remote_path = COALESCE(?6, old_remote_path) \
                         WHERE id = ?1",
                    )
                    .bind(id)
                    .bind(kind.as_str())
                    .bind(job.remote_path.as_str())
                    .bind(content_hash.as_ref().map(ContentHash::as_str))
                    .bind(job.old_local_path.as_ref().map(LocalPath::as_key))
                    .bind(job.old_remote_path.as_ref().map(RemotePath::as_str))
                    .execute(&mut *tx)
                    .await?;
                    written += 1;
                }
                Coalesced::InsertSeparate => {
                    sqlx::query(
                        "INSERT INTO sync_jobs \
                             (event_type, local_path, remote_path, old_local_path, \
                              old_remote_path, content_hash, state, n_retries, retry_at, \
                              created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING', 0, 0, ?7)",
                    )
                    .bind(job.kind.as_str())
                    .bind(job.local_path.as_key())
                    .bind(job.remote_path.as_str())
                    .bind(job.old_local_path.as_ref().map(LocalPath::as_key))
                    .bind(job.old_remote_path.as_ref().map(RemotePath::as_str))
                    .bind(job.content_hash.as_ref().map(ContentHash::as_str))
                    .bind(created_at)
                    .execute(&mut *tx)
                    .await?;
                    written += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn claim_next_job(&self, now_ms: i64) -> anyhow::Result<Option<SyncJob>> {
        // Single statement, so select-and-flip is atomic. Paths with a row
        // already in flight are skipped to keep per-path serialization.
        let row = sqlx::query(
            "UPDATE sync_jobs SET state = 'PROCESSING' \
             WHERE id = ( \
                 SELECT id FROM sync_jobs \
                 WHERE state = 'PENDING' AND retry_at <= ?1 \
                   AND local_path NOT IN ( \
                       SELECT local_path FROM sync_jobs WHERE state = 'PROCESSING' \
                   ) \
                 ORDER BY id LIMIT 1 \
             ) \
             RETURNING *",
        )
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| job_from_row(&r)).transpose().map_err(Into::into)
    }

    async fn complete_job(&self, id: i64, effects: CompletionEffects) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE sync_jobs SET state = 'SYNCED', last_error = NULL WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        match effects {
            CompletionEffects::Upsert {
                mapping,
                content_hash,
                change_token,
            } => {
                let key = mapping.local_path.as_key();
                sqlx::query(
                    "INSERT INTO node_mapping \
                         (local_path, node_uid, parent_node_uid, is_directory) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(local_path) DO UPDATE SET \
                         node_uid = excluded.node_uid, \
                         parent_node_uid = excluded.parent_node_uid, \
                         is_directory = excluded.is_directory",
                )
                .bind(&key)
                .bind(mapping.node_uid.as_str())
                .bind(mapping.parent_uid.as_ref().map(NodeUid::as_str))
                .bind(mapping.is_directory as i64)
                .execute(&mut *tx)
                .await?;

                if let Some(hash) = content_hash {
                    sqlx::query(
                        "INSERT INTO file_hashes (local_path, content_hash) VALUES (?1, ?2) \
                         ON CONFLICT(local_path) DO UPDATE SET \
                             content_hash = excluded.content_hash",
                    )
                    .bind(&key)
                    .bind(hash.as_str())
                    .execute(&mut *tx)
                    .await?;
                }

                sqlx::query(
                    "INSERT INTO file_state (local_path, change_token) VALUES (?1, ?2) \
                     ON CONFLICT(local_path) DO UPDATE SET \
                         change_token = excluded.change_token",
                )
                .bind(&key)
                .bind(change_token.to_string())
                .execute(&mut *tx)
                .await?;
            }
            CompletionEffects::Remove { path, subtree } => {
                remove_path_rows(&mut tx, &path.as_key(), subtree).await?;
            }
            CompletionEffects::Relocate {
                old_path,
                new_path,
                subtree,
                new_parent,
            } => {
                relocate_path_rows(&mut tx, &old_path.as_key(), &new_path.as_key(), subtree)
                    .await?;
                if let Some(parent) = new_parent {
                    sqlx::query(
                        "UPDATE node_mapping SET parent_node_uid = ?2 WHERE local_path = ?1",
                    )
                    .bind(new_path.as_key())
                    .bind(parent.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
            }
            CompletionEffects::None => {}
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fail_job(&self, id: i64, disposition: FailureDisposition) -> anyhow::Result<()> {
        match disposition {
            FailureDisposition::Retry {
                retry_at_ms,
                error,
                convert_to,
            } => {
                sqlx::query(
                    "UPDATE sync_jobs SET \
                         state = 'PENDING', \
                         n_retries = n_retries + 1, \
                         retry_at = ?2, \
                         last_error = ?3, \
                         event_type = COALESCE(?4, event_type) \
                     WHERE id = ?1",
                )
                .bind(id)
                .bind(retry_at_ms)
                .bind(&error)
                .bind(convert_to.map(|k| k.as_str()))
                .execute(&self.pool)
                .await?;
            }
            FailureDisposition::Block { error } => {
                sqlx::query(
                    "UPDATE sync_jobs SET state = 'BLOCKED', last_error = ?2 WHERE id = ?1",
                )
                .bind(id)
                .bind(&error)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn recover_processing(&self, now_ms: i64) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET state = 'PENDING', retry_at = ?1 WHERE state = 'PROCESSING'",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn prune_synced(&self, before_ms: i64) -> anyhow::Result<u64> {
        let result =
            sqlx::query("DELETE FROM sync_jobs WHERE state = 'SYNCED' AND created_at < ?1")
                .bind(before_ms)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn job(&self, id: i64) -> anyhow::Result<Option<SyncJob>> {
        let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose().map_err(Into::into)
    }

    async fn jobs_for_path(&self, path: &LocalPath) -> anyhow::Result<Vec<SyncJob>> {
        let rows = sqlx::query("SELECT * FROM sync_jobs WHERE local_path = ?1 ORDER BY id")
            .bind(path.as_key())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| job_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn queue_stats(&self) -> anyhow::Result<QueueStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM sync_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            match JobState::parse(&state).map_err(|e| StoreError::CorruptRow(e.to_string()))? {
                JobState::Pending => stats.pending = n as u64,
                JobState::Processing => stats.processing = n as u64,
                JobState::Synced => stats.synced = n as u64,
                JobState::Blocked => stats.blocked = n as u64,
            }
        }
        Ok(stats)
    }

    async fn blocked_jobs(&self, limit: u32) -> anyhow::Result<Vec<SyncJob>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_jobs WHERE state = 'BLOCKED' ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| job_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn recent_synced(&self, limit: u32) -> anyhow::Result<Vec<SyncJob>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_jobs WHERE state = 'SYNCED' ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| job_from_row(r).map_err(Into::into))
            .collect()
    }

    // --- signal queue ---

    async fn push_signal(&self, signal: ControlSignal) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO signals (tag, created_at) VALUES (?1, ?2)")
            .bind(signal.as_str())
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pop_signal(&self) -> anyhow::Result<Option<ControlSignal>> {
        // Delete-returning keeps at-most-one-consumer semantics per tag.
        let row = sqlx::query(
            "DELETE FROM signals \
             WHERE id = (SELECT id FROM signals ORDER BY id LIMIT 1) \
             RETURNING tag",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let tag: String = row.get("tag");
                let signal = ControlSignal::parse(&tag)
                    .map_err(|e| StoreError::CorruptRow(e.to_string()))?;
                Ok(Some(signal))
            }
            None => Ok(None),
        }
    }

    async fn clear_signals(&self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM signals").execute(&self.pool).await?;
        Ok(())
    }

    // --- maintenance ---

    async fn clear_all(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["file_state", "file_hashes", "node_mapping", "sync_jobs", "signals"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn reset_retry_timers(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("UPDATE sync_jobs SET retry_at = 0 WHERE state = 'PENDING'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
