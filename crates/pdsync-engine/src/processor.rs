//! Concurrent job processor
//!
//! Pulls ready jobs from the durable queue and executes them against the
//! drive with a bounded pool of in-flight tasks. Each task runs exactly one
//! job, reports its outcome through the queue's transactions, and the
//! failure of one job never touches another.
//!
//! ## Ordering
//!
//! Per-path serialization comes from the claim query (a path with a row in
//! flight yields nothing) plus enqueue coalescing; across paths the pool
//! runs freely.
//!
//! ## Shutdown
//!
//! On cancellation the loop stops claiming, waits up to the grace period
//! for in-flight tasks, then aborts the rest. Aborted jobs stay
//! `PROCESSING` in the store and are re-queued by startup recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pdsync_core::domain::job::{EventKind, SyncJob};
use pdsync_core::domain::newtypes::{ContentHash, NodeUid, RemotePath};
use pdsync_core::ports::drive_client::{
    DriveClient, DriveError, FileMeta, NodeKind, RelocateRequest, RemoteNode,
};
use pdsync_core::ports::state_store::{CompletionEffects, NodeMappingRecord, StateStore};

use crate::hash::compute_sha1;
use crate::queue::{classify, ErrorClass, JobQueue};
use crate::scan::token_of;

/// Control loop tick.
pub const TICK: Duration = Duration::from_secs(1);

/// How long shutdown waits for in-flight tasks before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// ============================================================================
// Failure plumbing
// ============================================================================

/// A job failure, already classified for the retry policy.
#[derive(Debug)]
struct JobFailure {
    class: ErrorClass,
    message: String,
}

impl JobFailure {
    fn client_state(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::ClientState,
            message: message.into(),
        }
    }
}

impl From<DriveError> for JobFailure {
    fn from(err: DriveError) -> Self {
        Self {
            class: classify(&err),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for JobFailure {
    // Local reads and store lookups failing usually means our bookkeeping
    // or the file raced with the user; a few retries, then surface it.
    fn from(err: anyhow::Error) -> Self {
        Self::client_state(format!("{err:#}"))
    }
}

type JobResult = Result<CompletionEffects, JobFailure>;

// ============================================================================
// Folder cache
// ============================================================================

/// Remote folder resolution with a shared path->uid cache.
///
/// By-name lookups drain every listing page, so a miss really means the
/// child does not exist.
struct FolderCache {
    drive: Arc<dyn DriveClient>,
    by_path: DashMap<String, NodeUid>,
}

impl FolderCache {
    fn new(drive: Arc<dyn DriveClient>) -> Self {
        Self {
            drive,
            by_path: DashMap::new(),
        }
    }

    async fn root(&self) -> Result<NodeUid, DriveError> {
        if let Some(uid) = self.by_path.get("/") {
            return Ok(uid.clone());
        }
        let uid = self.drive.get_root_folder().await?;
        self.by_path.insert("/".to_string(), uid.clone());
        Ok(uid)
    }

    /// Search a folder for a child by name, draining every page.
    async fn find_child(
        &self,
        parent: &NodeUid,
        name: &str,
    ) -> Result<Option<RemoteNode>, DriveError> {
        let mut cursor = None;
        let mut found = None;
        loop {
            let page = self.drive.iterate_children(parent, cursor).await?;
            for node in page.nodes {
                if node.name == name {
                    found = Some(node);
                }
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(found)
    }

    /// Walk `path`'s segments from the root, reusing existing folders and
    /// (when `create` is set) creating the missing remainder in order.
    ///
    /// Returns `None` only in lookup mode when a segment is absent.
    async fn resolve_folder(
        &self,
        path: &RemotePath,
        create: bool,
    ) -> Result<Option<NodeUid>, DriveError> {
        let mut uid = self.root().await?;
        let mut walked = String::new();

        for segment in path.segments() {
            walked.push('/');
            walked.push_str(segment);

            if let Some(hit) = self.by_path.get(&walked) {
                uid = hit.clone();
                continue;
            }

            match self.find_child(&uid, segment).await? {
                Some(node) if node.kind == NodeKind::Folder => {
                    self.by_path.insert(walked.clone(), node.uid.clone());
                    uid = node.uid;
                }
                Some(_) => {
                    return Err(DriveError::Permanent {
                        status: 409,
                        message: format!("{walked} exists remotely as a file"),
                    });
                }
                None if create => {
                    let created = self.drive.create_folder(&uid, segment, None).await?;
                    debug!(path = %walked, uid = %created, "Created remote folder");
                    self.by_path.insert(walked.clone(), created.clone());
                    uid = created;
                }
                None => return Ok(None),
            }
        }

        Ok(Some(uid))
    }

    /// Resolve a folder, creating missing segments. Wraps the `None`
    /// case (impossible in create mode) as an error instead of panicking.
    async fn ensure_folder(&self, path: &RemotePath) -> Result<NodeUid, DriveError> {
        self.resolve_folder(path, true)
            .await?
            .ok_or_else(|| DriveError::Permanent {
                status: 500,
                message: format!("folder walk of {path} yielded nothing in create mode"),
            })
    }

    /// Drop cached uids at and under a remote path (after folder deletes,
    /// renames and moves).
    fn invalidate_subtree(&self, path: &RemotePath) {
        let exact = path.as_str().to_string();
        let prefix = if exact == "/" {
            exact.clone()
        } else {
            format!("{exact}/")
        };
        self.by_path
            .retain(|key, _| key != &exact && !key.starts_with(&prefix));
    }
}

// ============================================================================
// Processor
// ============================================================================

struct ProcessorInner {
    store: Arc<dyn StateStore>,
    queue: JobQueue,
    drive: Arc<dyn DriveClient>,
    folders: FolderCache,
}

/// Bounded-pool job processor.
pub struct Processor {
    inner: Arc<ProcessorInner>,
    concurrency: usize,
}

impl Processor {
    /// Create a processor over the store and drive client.
    pub fn new(
        store: Arc<dyn StateStore>,
        drive: Arc<dyn DriveClient>,
        concurrency: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                store: Arc::clone(&store),
                queue: JobQueue::new(store),
                drive: Arc::clone(&drive),
                folders: FolderCache::new(drive),
            }),
            concurrency: concurrency.max(1),
        }
    }

    /// Run the claim loop until cancelled.
    ///
    /// The loop wakes on a fixed tick and on every task completion; while
    /// `paused` is set it keeps running tasks but claims nothing new.
    pub async fn run(&self, paused: Arc<AtomicBool>, shutdown: CancellationToken) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(concurrency = self.concurrency, "Processor started");

        loop {
            if !paused.load(Ordering::Acquire) {
                while tasks.len() < self.concurrency {
                    match self.inner.queue.next_ready().await {
                        Ok(Some(job)) => {
                            let inner = Arc::clone(&self.inner);
                            tasks.spawn(async move {
                                run_job(&inner, job).await;
                            });
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "Failed to claim next job");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = tick.tick() => {}
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!(error = %e, "Job task panicked");
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!(in_flight = tasks.len(), "Processor stopping");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown grace elapsed, aborting in-flight tasks");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("Processor stopped");
    }
}

/// Execute one claimed job and persist its outcome.
async fn run_job(inner: &ProcessorInner, job: SyncJob) {
    debug!(job_id = job.id, kind = %job.kind, path = %job.local_path, "Executing job");

    let result = match job.kind {
        EventKind::Create | EventKind::Update => handle_upsert(inner, &job).await,
        EventKind::Delete => handle_delete(inner, &job).await,
        EventKind::Rename => handle_relocate(inner, &job, false).await,
        EventKind::Move => handle_relocate(inner, &job, true).await,
        EventKind::DeleteAndCreate => handle_replace(inner, &job).await,
    };

    let outcome = match result {
        Ok(effects) => inner.queue.mark_synced(job.id, effects).await,
        Err(failure) => {
            inner
                .queue
                .schedule_retry(&job, failure.class, failure.message)
                .await
        }
    };
    if let Err(e) = outcome {
        // The store write itself failed; the row stays PROCESSING and
        // startup recovery will return it to PENDING.
        error!(job_id = job.id, error = %e, "Failed to persist job outcome");
    }
}

// ============================================================================
// Per-kind handlers
// ============================================================================

/// CREATE / UPDATE: walk ancestor folders, then upload or skip-on-identical.
async fn handle_upsert(inner: &ProcessorInner, job: &SyncJob) -> JobResult {
    let metadata = match tokio::fs::metadata(job.local_path.as_path()).await {
        Ok(m) => m,
        Err(_) => {
            // The file vanished after classification; the matching delete
            // event is (or will be) in the queue.
            warn!(path = %job.local_path, "Local path gone before upload, skipping");
            return Ok(CompletionEffects::None);
        }
    };
    let token = token_of(&metadata);

    if metadata.is_dir() {
        let uid = inner.folders.ensure_folder(&job.remote_path).await?;
        let parent_uid = match job.remote_path.parent() {
            Some(parent) => Some(inner.folders.ensure_folder(&parent).await?),
            None => None,
        };
        return Ok(CompletionEffects::Upsert {
            mapping: NodeMappingRecord {
                local_path: job.local_path.clone(),
                node_uid: uid,
                parent_uid,
                is_directory: true,
            },
            content_hash: None,
            change_token: token,
        });
    }

    let parent_path = job.remote_path.parent().unwrap_or_else(RemotePath::root);
    let parent_uid = inner.folders.ensure_folder(&parent_path).await?;
    let name = job
        .remote_path
        .file_name()
        .ok_or_else(|| JobFailure::client_state("upload target has no file name"))?
        .to_string();

    let local_hash = match &job.content_hash {
        Some(hash) => hash.clone(),
        None => compute_sha1(job.local_path.as_path()).await?,
    };

    let uid = match inner.folders.find_child(&parent_uid, &name).await? {
        Some(node) if node.kind == NodeKind::File => {
            if revision_matches(&node, &local_hash) {
                debug!(path = %job.local_path, "Remote revision identical, skipping upload");
                node.uid
            } else {
                let stream = open_stream(job).await?;
                inner
                    .drive
                    .upload_revision(&node.uid, file_meta(&metadata, &local_hash), stream)
                    .await?
            }
        }
        Some(_) => {
            return Err(DriveError::Permanent {
                status: 409,
                message: format!("{} exists remotely as a folder", job.remote_path),
            }
            .into());
        }
        None => {
            let stream = open_stream(job).await?;
            inner
                .drive
                .upload_file(&parent_uid, &name, file_meta(&metadata, &local_hash), stream)
                .await?
        }
    };

    Ok(CompletionEffects::Upsert {
        mapping: NodeMappingRecord {
            local_path: job.local_path.clone(),
            node_uid: uid,
            parent_uid: Some(parent_uid),
            is_directory: false,
        },
        content_hash: Some(local_hash),
        change_token: token,
    })
}

/// DELETE: resolve the node, trash and delete it; absence is success.
async fn handle_delete(inner: &ProcessorInner, job: &SyncJob) -> JobResult {
    match resolve_delete_target(inner, job).await? {
        Some((uid, is_directory)) => {
            remote_delete(inner, &uid).await?;
            if is_directory {
                let remote = job.old_remote_path.as_ref().unwrap_or(&job.remote_path);
                inner.folders.invalidate_subtree(remote);
            }
            Ok(CompletionEffects::Remove {
                path: job.local_path.clone(),
                subtree: is_directory,
            })
        }
        None => {
            debug!(path = %job.local_path, "Remote node already absent");
            Ok(CompletionEffects::Remove {
                path: job.local_path.clone(),
                subtree: true,
            })
        }
    }
}

/// RENAME / MOVE: relocate the mapped node, then rewrite the path prefix.
async fn handle_relocate(inner: &ProcessorInner, job: &SyncJob, is_move: bool) -> JobResult {
    let old_local = job
        .old_local_path
        .as_ref()
        .ok_or_else(|| JobFailure::client_state("relocate job missing its old path"))?;
    let mapping = inner
        .store
        .node_mapping(old_local)
        .await?
        .ok_or_else(|| {
            JobFailure::client_state(format!("no node mapping for {old_local}"))
        })?;

    let new_name = job
        .local_path
        .file_name()
        .ok_or_else(|| JobFailure::client_state("relocate target has no file name"))?;

    let new_parent = if is_move {
        let parent_path = job.remote_path.parent().unwrap_or_else(RemotePath::root);
        Some(inner.folders.ensure_folder(&parent_path).await?)
    } else {
        None
    };

    inner
        .drive
        .relocate(
            &mapping.node_uid,
            RelocateRequest {
                new_parent: new_parent.clone(),
                new_name: Some(new_name),
            },
        )
        .await?;

    if mapping.is_directory {
        if let Some(old_remote) = &job.old_remote_path {
            inner.folders.invalidate_subtree(old_remote);
        }
    }

    Ok(CompletionEffects::Relocate {
        old_path: old_local.clone(),
        new_path: job.local_path.clone(),
        subtree: mapping.is_directory,
        new_parent,
    })
}

/// DELETE_AND_CREATE: remove the old remote node (absence tolerated), then
/// create afresh. Old and new share the local path, so the create's
/// completion effects overwrite the old rows; a crash between the steps
/// replays harmlessly because the delete half is idempotent.
async fn handle_replace(inner: &ProcessorInner, job: &SyncJob) -> JobResult {
    if let Some((uid, is_directory)) = resolve_delete_target(inner, job).await? {
        remote_delete(inner, &uid).await?;
        if is_directory {
            let remote = job.old_remote_path.as_ref().unwrap_or(&job.remote_path);
            inner.folders.invalidate_subtree(remote);
        }
    }
    handle_upsert(inner, job).await
}

// ============================================================================
// Helpers
// ============================================================================

fn revision_matches(node: &RemoteNode, local_hash: &ContentHash) -> bool {
    node.active_revision
        .as_ref()
        .and_then(|rev| rev.sha1.as_ref())
        .is_some_and(|sha1| sha1 == local_hash)
}

fn file_meta(metadata: &std::fs::Metadata, hash: &ContentHash) -> FileMeta {
    FileMeta {
        size: metadata.len(),
        mtime_ms: token_of(metadata).mtime_ms,
        sha1: Some(hash.clone()),
    }
}

async fn open_stream(job: &SyncJob) -> Result<pdsync_core::ports::drive_client::ByteStream, JobFailure> {
    let file = tokio::fs::File::open(job.local_path.as_path())
        .await
        .map_err(|e| {
            JobFailure::client_state(format!("failed to open {}: {e}", job.local_path))
        })?;
    Ok(Box::pin(file))
}

/// Find the remote node a delete should target: the stored mapping first,
/// else a by-name walk of the old remote path.
async fn resolve_delete_target(
    inner: &ProcessorInner,
    job: &SyncJob,
) -> Result<Option<(NodeUid, bool)>, JobFailure> {
    if let Some(mapping) = inner.store.node_mapping(&job.local_path).await? {
        return Ok(Some((mapping.node_uid, mapping.is_directory)));
    }

    let remote = job.old_remote_path.as_ref().unwrap_or(&job.remote_path);
    let Some(parent) = remote.parent() else {
        return Ok(None);
    };
    let Some(name) = remote.file_name() else {
        return Ok(None);
    };
    let Some(parent_uid) = inner.folders.resolve_folder(&parent, false).await? else {
        return Ok(None);
    };
    match inner.folders.find_child(&parent_uid, name).await? {
        Some(node) => Ok(Some((node.uid, node.kind == NodeKind::Folder))),
        None => Ok(None),
    }
}

/// Trash then delete, tolerating nodes that are already gone or trashed.
async fn remote_delete(inner: &ProcessorInner, uid: &NodeUid) -> Result<(), JobFailure> {
    let uids = [uid.clone()];
    for (_, result) in inner.drive.trash(&uids).await {
        match result {
            Ok(()) | Err(DriveError::NotFound(_)) | Err(DriveError::AlreadyTrashed(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    for (_, result) in inner.drive.delete(&uids).await {
        match result {
            Ok(()) | Err(DriveError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
