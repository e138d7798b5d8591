//! End-to-end pipeline tests: scan -> classify -> queue -> processor
//! against an in-memory drive, plus engine-level control flow.

mod common;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{MockAuth, MockDrive};
use pdsync_core::config::{Config, LoggingConfig, SyncDirConfig};
use pdsync_core::domain::job::{EventKind, JobState};
use pdsync_core::domain::newtypes::LocalPath;
use pdsync_core::domain::signal::ControlSignal;
use pdsync_core::ports::auth_provider::AuthError;
use pdsync_core::ports::drive_client::DriveError;
use pdsync_core::ports::state_store::StateStore;
use pdsync_engine::classifier::Classifier;
use pdsync_engine::exclude::ExcludeSet;
use pdsync_engine::hash::sha1_of_bytes;
use pdsync_engine::processor::Processor;
use pdsync_engine::scan::{scan_root, SyncRoot};
use pdsync_engine::{now_ms, Engine, EngineOptions};
use pdsync_store::{pool, SqliteStateStore};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

async fn new_store() -> Arc<SqliteStateStore> {
    let pool = pool::open_in_memory().await.expect("in-memory pool");
    Arc::new(SqliteStateStore::new(pool))
}

fn sync_root(dir: &tempfile::TempDir) -> SyncRoot {
    SyncRoot::new(dir.path(), "/backup").unwrap()
}

fn local(root: &SyncRoot, rel: &str) -> LocalPath {
    let mut path = root.local.clone();
    for part in rel.split('/') {
        path = path.join(part).unwrap();
    }
    path
}

fn remote_str(root: &SyncRoot, rel: &str) -> String {
    format!("{}/{}", root.remote_base.as_str(), rel)
}

/// Scan the root and enqueue whatever the classifier produces.
async fn scan_and_enqueue(store: &Arc<SqliteStateStore>, root: &SyncRoot) -> u64 {
    let snapshot = store.file_state_snapshot().await.unwrap();
    let changes = scan_root(root, &ExcludeSet::default(), &snapshot)
        .await
        .unwrap();
    let classifier = Classifier::new(
        Arc::clone(store) as Arc<dyn StateStore>,
        vec![root.clone()],
    );
    let classification = classifier.classify(changes).await.unwrap();

    let mut written = 0;
    if !classification.jobs.is_empty() {
        written = store.enqueue_batch(classification.jobs).await.unwrap();
    }
    for (path, token) in classification.unchanged_tokens {
        store.upsert_change_token(&path, token).await.unwrap();
    }
    written
}

/// Run a processor until the queue is quiet, then stop it.
async fn drain(store: &Arc<SqliteStateStore>, drive: &Arc<MockDrive>) {
    let processor = Processor::new(
        Arc::clone(store) as Arc<dyn StateStore>,
        Arc::clone(drive) as Arc<dyn pdsync_core::ports::drive_client::DriveClient>,
        4,
    );
    let token = CancellationToken::new();
    let paused = Arc::new(AtomicBool::new(false));
    let handle = {
        let token = token.clone();
        tokio::spawn(async move { processor.run(paused, token).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let stats = store.queue_stats().await.unwrap();
        if stats.pending == 0 && stats.processing == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue did not drain: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    token.cancel();
    handle.await.unwrap();
}

// ---------------------------------------------------------------------------
// Spec scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_run_scan_creates_everything() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
    std::fs::create_dir(dir.path().join("dir")).unwrap();
    std::fs::write(dir.path().join("dir/b.txt"), "bye").unwrap();

    let store = new_store().await;
    let root = sync_root(&dir);
    let drive = MockDrive::new();

    let written = scan_and_enqueue(&store, &root).await;
    assert_eq!(written, 3);

    drain(&store, &drive).await;

    // All three jobs completed.
    let stats = store.queue_stats().await.unwrap();
    assert_eq!(stats.synced, 3);
    assert_eq!(stats.blocked, 0);

    // The remote mirror matches, under remote_root/<base>/...
    let a_uid = drive.uid_of_path(&remote_str(&root, "a.txt")).unwrap();
    assert_eq!(drive.content_of(&a_uid).unwrap(), b"hi");
    let b_uid = drive.uid_of_path(&remote_str(&root, "dir/b.txt")).unwrap();
    assert_eq!(drive.content_of(&b_uid).unwrap(), b"bye");

    // Exactly the scanned paths are tracked.
    let snapshot = store.file_state_snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 3);
    for rel in ["a.txt", "dir", "dir/b.txt"] {
        let path = local(&root, rel);
        assert!(snapshot.contains_key(&path.as_key()), "{rel} missing");
        assert!(
            store.node_mapping(&path).await.unwrap().is_some(),
            "{rel} unmapped"
        );
    }
    // Content hashes exist for the two files (directories carry none).
    assert!(store
        .content_hash(&local(&root, "a.txt"))
        .await
        .unwrap()
        .is_some());
    assert!(store
        .content_hash(&local(&root, "dir/b.txt"))
        .await
        .unwrap()
        .is_some());
    assert!(store
        .content_hash(&local(&root, "dir"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn modified_content_yields_one_update_preserving_uid() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hi").unwrap();

    let store = new_store().await;
    let root = sync_root(&dir);
    let drive = MockDrive::new();
    scan_and_enqueue(&store, &root).await;
    drain(&store, &drive).await;

    let original_uid = drive.uid_of_path(&remote_str(&root, "a.txt")).unwrap();

    // Same size, different bytes; give mtime a chance to move.
    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::write(dir.path().join("a.txt"), "ho").unwrap();

    let written = scan_and_enqueue(&store, &root).await;
    assert_eq!(written, 1);
    let jobs = store.jobs_for_path(&local(&root, "a.txt")).await.unwrap();
    assert_eq!(jobs.last().unwrap().kind, EventKind::Update);

    drain(&store, &drive).await;

    // Revised in place: same node, new bytes, new stored hash.
    let uid = drive.uid_of_path(&remote_str(&root, "a.txt")).unwrap();
    assert_eq!(uid, original_uid);
    assert_eq!(drive.content_of(&uid).unwrap(), b"ho");
    assert_eq!(
        store
            .content_hash(&local(&root, "a.txt"))
            .await
            .unwrap()
            .unwrap(),
        sha1_of_bytes(b"ho")
    );
}

#[tokio::test]
async fn touch_without_content_change_yields_no_jobs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hi").unwrap();

    let store = new_store().await;
    let root = sync_root(&dir);
    let drive = MockDrive::new();
    scan_and_enqueue(&store, &root).await;
    drain(&store, &drive).await;
    let uploads_before = drive.upload_count();

    // Rewrite identical bytes: the token changes, the content does not.
    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::write(dir.path().join("a.txt"), "hi").unwrap();

    let written = scan_and_enqueue(&store, &root).await;
    assert_eq!(written, 0, "identical content must not enqueue a job");
    assert_eq!(drive.upload_count(), uploads_before);

    // But the stored token advanced to the new one.
    let token = store
        .change_token(&local(&root, "a.txt"))
        .await
        .unwrap()
        .unwrap();
    let meta = std::fs::metadata(dir.path().join("a.txt")).unwrap();
    assert_eq!(token, pdsync_engine::scan::token_of(&meta));
}

#[tokio::test]
async fn rename_is_correlated_and_keeps_the_node() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("dir")).unwrap();
    std::fs::write(dir.path().join("dir/b.txt"), "bye").unwrap();

    let store = new_store().await;
    let root = sync_root(&dir);
    let drive = MockDrive::new();
    scan_and_enqueue(&store, &root).await;
    drain(&store, &drive).await;

    let original_uid = drive.uid_of_path(&remote_str(&root, "dir/b.txt")).unwrap();

    std::fs::rename(dir.path().join("dir/b.txt"), dir.path().join("dir/c.txt")).unwrap();

    let written = scan_and_enqueue(&store, &root).await;
    assert_eq!(written, 1, "delete+create must collapse into one rename");
    let jobs = store.jobs_for_path(&local(&root, "dir/c.txt")).await.unwrap();
    let rename = jobs.last().unwrap();
    assert_eq!(rename.kind, EventKind::Rename);
    assert_eq!(rename.old_local_path, Some(local(&root, "dir/b.txt")));

    drain(&store, &drive).await;

    // Same node uid, new name; old path fully forgotten.
    let uid = drive.uid_of_path(&remote_str(&root, "dir/c.txt")).unwrap();
    assert_eq!(uid, original_uid);
    assert!(drive.uid_of_path(&remote_str(&root, "dir/b.txt")).is_none());
    assert!(store
        .node_mapping(&local(&root, "dir/b.txt"))
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        store
            .node_mapping(&local(&root, "dir/c.txt"))
            .await
            .unwrap()
            .unwrap()
            .node_uid
            .as_str(),
        original_uid
    );
}

#[tokio::test]
async fn directory_delete_survives_restart_mid_drain() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("dir")).unwrap();
    std::fs::write(dir.path().join("dir/b.txt"), "bye").unwrap();

    let store = new_store().await;
    let root = sync_root(&dir);
    let drive = MockDrive::new();
    scan_and_enqueue(&store, &root).await;
    drain(&store, &drive).await;

    std::fs::remove_dir_all(dir.path().join("dir")).unwrap();

    // Ancestor collapse: one DELETE job for the directory.
    let written = scan_and_enqueue(&store, &root).await;
    assert_eq!(written, 1);

    // Claim it, then "crash": the claim is never completed.
    let claimed = store.claim_next_job(now_ms()).await.unwrap().unwrap();
    assert_eq!(claimed.kind, EventKind::Delete);
    assert_eq!(claimed.local_path, local(&root, "dir"));

    // Restart: recovery re-queues the row, a fresh processor finishes it.
    let recovered = store.recover_processing(now_ms()).await.unwrap();
    assert_eq!(recovered, 1);
    drain(&store, &drive).await;

    let job = store.job(claimed.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Synced);
    assert!(drive.uid_of_path(&remote_str(&root, "dir")).is_none());

    // No descendant row survives the completion transaction.
    for rel in ["dir", "dir/b.txt"] {
        let path = local(&root, rel);
        assert!(store.node_mapping(&path).await.unwrap().is_none(), "{rel}");
        assert!(store.content_hash(&path).await.unwrap().is_none(), "{rel}");
        assert!(store.change_token(&path).await.unwrap().is_none(), "{rel}");
    }
}

#[tokio::test]
async fn upload_retries_through_transient_503s() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hi").unwrap();

    let store = new_store().await;
    let root = sync_root(&dir);
    let drive = MockDrive::new();
    drive.fail_next("upload_file", DriveError::Network("503 service unavailable".into()));
    drive.fail_next("upload_file", DriveError::Network("503 service unavailable".into()));

    scan_and_enqueue(&store, &root).await;
    drain(&store, &drive).await;

    let jobs = store.jobs_for_path(&local(&root, "a.txt")).await.unwrap();
    let job = jobs.last().unwrap();
    assert_eq!(job.state, JobState::Synced);
    assert_eq!(job.n_retries, 2);

    let uid = drive.uid_of_path(&remote_str(&root, "a.txt")).unwrap();
    assert_eq!(drive.content_of(&uid).unwrap(), b"hi");
    assert_eq!(
        store
            .content_hash(&local(&root, "a.txt"))
            .await
            .unwrap()
            .unwrap(),
        sha1_of_bytes(b"hi")
    );
}

#[tokio::test]
async fn permanent_failure_blocks_immediately() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hi").unwrap();

    let store = new_store().await;
    let root = sync_root(&dir);
    let drive = MockDrive::new();
    drive.fail_next(
        "upload_file",
        DriveError::Permanent {
            status: 403,
            message: "quota exceeded".into(),
        },
    );

    scan_and_enqueue(&store, &root).await;
    drain(&store, &drive).await;

    let blocked = store.blocked_jobs(10).await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].n_retries, 0);
    assert!(blocked[0].last_error.as_deref().unwrap().contains("quota"));
}

// ---------------------------------------------------------------------------
// Engine control flow
// ---------------------------------------------------------------------------

fn config_for(dir: &tempfile::TempDir) -> Config {
    Config {
        sync_dirs: vec![SyncDirConfig {
            source_path: dir.path().to_path_buf(),
            remote_root: "/backup".to_string(),
        }],
        sync_concurrency: 2,
        exclude_patterns: Vec::new(),
        local_drive_path: None,
        logging: LoggingConfig::default(),
    }
}

#[tokio::test]
async fn engine_stops_on_durable_stop_signal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hi").unwrap();

    let store = new_store().await;
    let drive = MockDrive::new();
    let auth = MockAuth::new(Arc::clone(&drive));

    store.push_signal(ControlSignal::Stop).await.unwrap();

    let engine = Engine::new(
        config_for(&dir),
        None,
        Arc::clone(&store) as Arc<dyn StateStore>,
        auth,
        EngineOptions {
            watch: false,
            ..EngineOptions::default()
        },
    );

    let result = tokio::time::timeout(
        Duration::from_secs(60),
        engine.run(CancellationToken::new()),
    )
    .await
    .expect("engine must honor the stop signal");
    assert!(result.is_ok());
}

#[tokio::test]
async fn engine_fails_fast_on_fatal_auth_error() {
    let dir = tempfile::tempdir().unwrap();

    let store = new_store().await;
    let drive = MockDrive::new();
    let auth = MockAuth::new(Arc::clone(&drive));
    auth.fail_next(AuthError::Fatal("bad mailbox password".into()));

    let engine = Engine::new(
        config_for(&dir),
        None,
        Arc::clone(&store) as Arc<dyn StateStore>,
        auth,
        EngineOptions {
            watch: false,
            ..EngineOptions::default()
        },
    );

    let result = engine.run(CancellationToken::new()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn dry_run_writes_nothing_anywhere() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "hi").unwrap();

    let store = new_store().await;
    let drive = MockDrive::new();
    let auth = MockAuth::new(Arc::clone(&drive));

    let engine = Engine::new(
        config_for(&dir),
        None,
        Arc::clone(&store) as Arc<dyn StateStore>,
        auth,
        EngineOptions {
            watch: false,
            dry_run: true,
            start_paused: false,
        },
    );

    engine.run(CancellationToken::new()).await.unwrap();

    assert_eq!(store.queue_stats().await.unwrap(), Default::default());
    assert!(store.file_state_snapshot().await.unwrap().is_empty());
    assert_eq!(drive.live_node_count(), 0);
}

#[tokio::test]
async fn missing_mapping_for_rename_blocks_after_client_state_retries() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("new.txt"), "hi").unwrap();

    let store = new_store().await;
    let root = sync_root(&dir);
    let drive = MockDrive::new();

    // A rename job whose old path was never mapped.
    let mut job = pdsync_core::domain::job::NewJob::new(
        EventKind::Rename,
        local(&root, "new.txt"),
        pdsync_core::domain::newtypes::RemotePath::new(remote_str(&root, "new.txt")).unwrap(),
    );
    job.old_local_path = Some(local(&root, "old.txt"));
    job.old_remote_path =
        Some(pdsync_core::domain::newtypes::RemotePath::new(remote_str(&root, "old.txt")).unwrap());
    store.enqueue_batch(vec![job]).await.unwrap();

    // CLIENT_STATE retries three times at 5s spacing, then blocks; the
    // drain deadline comfortably covers that.
    drain(&store, &drive).await;

    let blocked = store.blocked_jobs(10).await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].n_retries, 3);
    assert!(blocked[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("no node mapping"));
}
