//! Engine wiring and control loop
//!
//! Owns the full pipeline: startup recovery, authentication with backoff,
//! the initial scan, live watching, the processor pool, and the durable
//! control-signal loop (`stop`/`pause`/`resume`/`reload`).
//!
//! ## Startup sequence
//!
//! 1. Resolve sync roots (symlinks canonicalized) and exclusion globs
//! 2. Reset any `PROCESSING` job left over from a previous run
//! 3. Authenticate, retrying connection failures with fixed backoff
//! 4. Scan-diff every root and enqueue the resulting jobs
//! 5. Start the processor pool and (in watch mode) the live watcher
//! 6. Poll the signal queue until told to stop

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pdsync_core::config::Config;
use pdsync_core::domain::signal::ControlSignal;
use pdsync_core::ports::auth_provider::{AuthError, AuthProvider};
use pdsync_core::ports::drive_client::DriveClient;
use pdsync_core::ports::state_store::StateStore;

use crate::classifier::{Classification, Classifier};
use crate::exclude::ExcludeSet;
use crate::now_ms;
use crate::processor::Processor;
use crate::scan::{scan_root, SyncRoot};
use crate::watcher::{resolve_settled, FileWatcher, SettleQueue, DEFAULT_SETTLE};

/// How often the control loop polls the signal queue.
const SIGNAL_POLL: Duration = Duration::from_secs(1);

/// How often the watcher loop polls the settle queue.
const SETTLE_POLL: Duration = Duration::from_millis(200);

/// Authentication retry delays for connection failures, in seconds.
const AUTH_BACKOFF_SECS: [u64; 5] = [1, 4, 16, 64, 256];

/// Age after which completed job rows are pruned at startup.
const SYNCED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Engine start-up options (CLI flags).
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Keep a live watcher running after the initial scan
    pub watch: bool,
    /// Plan jobs but write nothing, locally or remotely
    pub dry_run: bool,
    /// Start with job claiming paused
    pub start_paused: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            watch: true,
            dry_run: false,
            start_paused: false,
        }
    }
}

/// The assembled sync engine.
pub struct Engine {
    config: Config,
    config_path: Option<PathBuf>,
    store: Arc<dyn StateStore>,
    auth: Arc<dyn AuthProvider>,
    options: EngineOptions,
}

impl Engine {
    /// Assemble an engine from its collaborators.
    ///
    /// `config_path` is kept for the `reload` signal; pass `None` when the
    /// configuration did not come from a file.
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        store: Arc<dyn StateStore>,
        auth: Arc<dyn AuthProvider>,
        options: EngineOptions,
    ) -> Self {
        Self {
            config,
            config_path,
            store,
            auth,
            options,
        }
    }

    /// Run until the `stop` signal arrives or `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let roots = self
            .config
            .sync_dirs
            .iter()
            .map(|d| SyncRoot::new(&d.source_path, &d.remote_root))
            .collect::<Result<Vec<_>>>()?;
        let exclude = Arc::new(RwLock::new(
            ExcludeSet::new(&self.config.exclude_patterns)
                .context("Invalid exclusion pattern")?,
        ));

        if self.options.dry_run {
            return self.dry_run(&roots, &exclude).await;
        }

        // Startup recovery: jobs interrupted by the previous shutdown.
        let recovered = self.store.recover_processing(now_ms()).await?;
        if recovered > 0 {
            info!(recovered, "Recovered interrupted jobs");
        }
        let pruned = self
            .store
            .prune_synced(now_ms() - SYNCED_RETENTION.as_millis() as i64)
            .await?;
        if pruned > 0 {
            info!(pruned, "Pruned old completed jobs");
        }

        let drive = connect_with_backoff(self.auth.as_ref(), &shutdown).await?;

        let classifier = Arc::new(Classifier::new(Arc::clone(&self.store), roots.clone()));
        let paused = Arc::new(AtomicBool::new(self.options.start_paused));
        if self.options.start_paused {
            info!("Starting paused");
        }

        // Initial scan-diff over every root, one batch per root.
        for root in &roots {
            let snapshot = self.store.file_state_snapshot().await?;
            let guard = exclude.read().expect("exclude lock poisoned").clone();
            let changes = scan_root(root, &guard, &snapshot).await?;
            if changes.is_empty() {
                continue;
            }
            let classification = classifier.classify(changes).await?;
            self.persist(classification).await?;
        }

        // Processor pool.
        let processor = Processor::new(
            Arc::clone(&self.store),
            Arc::clone(&drive),
            self.config.sync_concurrency as usize,
        );
        let processor_task = {
            let paused = Arc::clone(&paused);
            let token = shutdown.clone();
            tokio::spawn(async move { processor.run(paused, token).await })
        };

        // Live watcher.
        let watcher_task = if self.options.watch {
            let (mut watcher, rx) = FileWatcher::new()?;
            for root in &roots {
                watcher.watch(root.local.as_path())?;
                info!(root = %root.local, "Watching");
            }
            let store = Arc::clone(&self.store);
            let classifier = Arc::clone(&classifier);
            let exclude = Arc::clone(&exclude);
            let roots = roots.clone();
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                // The watcher must stay alive for events to keep flowing.
                let _watcher = watcher;
                watch_loop(store, classifier, roots, exclude, rx, token).await;
            }))
        } else {
            None
        };

        // Control loop: the durable signal queue is the engine's only
        // command channel.
        let mut tick = tokio::time::interval(SIGNAL_POLL);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.drain_signals(&paused, &exclude, &shutdown).await {
                        error!(error = %e, "Failed to process control signals");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Engine shutting down");
        if let Some(task) = watcher_task {
            let _ = task.await;
        }
        let _ = processor_task.await;
        info!("Engine stopped");
        Ok(())
    }

    /// Pop and apply every queued control signal.
    async fn drain_signals(
        &self,
        paused: &AtomicBool,
        exclude: &RwLock<ExcludeSet>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        while let Some(signal) = self.store.pop_signal().await? {
            info!(signal = %signal, "Control signal received");
            match signal {
                ControlSignal::Stop => shutdown.cancel(),
                ControlSignal::Pause => paused.store(true, Ordering::Release),
                ControlSignal::Resume => paused.store(false, Ordering::Release),
                ControlSignal::Reload => self.reload(exclude),
            }
        }
        Ok(())
    }

    /// Re-read the configuration file and apply what can change at runtime.
    fn reload(&self, exclude: &RwLock<ExcludeSet>) {
        let Some(path) = &self.config_path else {
            warn!("Reload requested but no config file path is known");
            return;
        };
        let fresh = match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Reload failed, keeping old config");
                return;
            }
        };
        let problems = fresh.validate();
        if !problems.is_empty() {
            for p in &problems {
                error!(field = %p.field, message = %p.message, "Reload rejected");
            }
            return;
        }
        match ExcludeSet::new(&fresh.exclude_patterns) {
            Ok(set) => {
                *exclude.write().expect("exclude lock poisoned") = set;
                info!("Exclusion patterns reloaded");
            }
            Err(e) => error!(error = %e, "Reload rejected: bad exclusion pattern"),
        }
        if fresh.sync_dirs.len() != self.config.sync_dirs.len()
            || fresh.sync_concurrency != self.config.sync_concurrency
        {
            warn!("Changes to sync_dirs or sync_concurrency take effect on restart");
        }
    }

    /// Persist one classification batch.
    async fn persist(&self, classification: Classification) -> Result<()> {
        if !classification.jobs.is_empty() {
            let written = self.store.enqueue_batch(classification.jobs).await?;
            info!(jobs = written, "Enqueued change batch");
        }
        for (path, token) in classification.unchanged_tokens {
            self.store.upsert_change_token(&path, token).await?;
        }
        Ok(())
    }

    /// Dry-run: scan, classify and report, writing nothing anywhere.
    async fn dry_run(&self, roots: &[SyncRoot], exclude: &RwLock<ExcludeSet>) -> Result<()> {
        let classifier = Classifier::new(Arc::clone(&self.store), roots.to_vec());
        let mut planned = 0usize;

        for root in roots {
            let snapshot = self.store.file_state_snapshot().await?;
            let guard = exclude.read().expect("exclude lock poisoned").clone();
            let changes = scan_root(root, &guard, &snapshot).await?;
            let classification = classifier.classify(changes).await?;
            for job in &classification.jobs {
                info!(
                    kind = %job.kind,
                    path = %job.local_path,
                    remote = %job.remote_path,
                    "Would sync"
                );
                planned += 1;
            }
        }

        info!(planned, "Dry run complete");
        Ok(())
    }
}

// ============================================================================
// Watch loop
// ============================================================================

/// Consume touched paths, debounce them, and feed settled batches through
/// the classifier.
async fn watch_loop(
    store: Arc<dyn StateStore>,
    classifier: Arc<Classifier>,
    roots: Vec<SyncRoot>,
    exclude: Arc<RwLock<ExcludeSet>>,
    mut rx: mpsc::Receiver<PathBuf>,
    shutdown: CancellationToken,
) {
    let mut settle = SettleQueue::new(DEFAULT_SETTLE);
    let mut poll = tokio::time::interval(SETTLE_POLL);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(path) => settle.touch(path),
                None => {
                    info!("Watcher channel closed");
                    break;
                }
            },
            _ = poll.tick() => {
                let settled = settle.poll();
                if settled.is_empty() {
                    continue;
                }
                let guard = exclude.read().expect("exclude lock poisoned").clone();
                let changes =
                    match resolve_settled(store.as_ref(), &roots, &guard, settled).await {
                        Ok(changes) => changes,
                        Err(e) => {
                            error!(error = %e, "Failed to resolve settled events");
                            continue;
                        }
                    };
                if changes.is_empty() {
                    continue;
                }
                match classifier.classify(changes).await {
                    Ok(classification) if !classification.is_empty() => {
                        if let Err(e) = persist_batch(store.as_ref(), classification).await {
                            error!(error = %e, "Failed to persist change batch");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Classification failed"),
                }
            },
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn persist_batch(store: &dyn StateStore, classification: Classification) -> Result<()> {
    if !classification.jobs.is_empty() {
        store.enqueue_batch(classification.jobs).await?;
    }
    for (path, token) in classification.unchanged_tokens {
        store.upsert_change_token(&path, token).await?;
    }
    Ok(())
}

// ============================================================================
// Authentication
// ============================================================================

/// Authenticate, retrying connection failures with fixed backoff
/// (1 s, 4 s, 16 s, 64 s, 256 s). Any other failure is fatal to startup.
async fn connect_with_backoff(
    auth: &dyn AuthProvider,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn DriveClient>> {
    let mut attempt = 0usize;
    loop {
        match auth.connect().await {
            Ok(client) => {
                info!("Authenticated");
                return Ok(client);
            }
            Err(AuthError::ConnectionFailed(msg)) => {
                if attempt >= AUTH_BACKOFF_SECS.len() {
                    bail!("Authentication failed after {attempt} connection retries: {msg}");
                }
                let delay = Duration::from_secs(AUTH_BACKOFF_SECS[attempt]);
                warn!(
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs(),
                    error = %msg,
                    "Connection failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => bail!("Shutdown requested during authentication"),
                }
                attempt += 1;
            }
            Err(AuthError::Fatal(msg)) => bail!("Authentication failed: {msg}"),
        }
    }
}
