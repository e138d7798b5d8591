//! Job queue façade: error classification and retry backoff
//!
//! The queue itself is durable (the `sync_jobs` table); this module wraps
//! the store with the retry policy. Failures are classified once, at the
//! single catch point per job, and each class maps to a backoff schedule:
//!
//! | Class             | Max retries | Backoff |
//! |-------------------|-------------|---------|
//! | TRANSIENT_NETWORK | unlimited   | 2^n * 1s, capped at 5 min, jitter +/-20% |
//! | RATE_LIMITED      | unlimited   | server hint, else 30s |
//! | REUPLOAD_NEEDED   | 5           | 2^n * 1s, capped at 2 min; converts to DELETE_AND_CREATE at n >= 2 |
//! | CLIENT_STATE      | 3           | 5s |
//! | PERMANENT         | 0           | blocked immediately |

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use pdsync_core::domain::job::{EventKind, SyncJob};
use pdsync_core::ports::drive_client::DriveError;
use pdsync_core::ports::state_store::{CompletionEffects, FailureDisposition, StateStore};

use crate::now_ms;

// ============================================================================
// Error classification
// ============================================================================

/// Retry class of a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection resets, timeouts, 5xx: the world will heal
    TransientNetwork,
    /// The server asked us to slow down
    RateLimited {
        /// Server-provided wait hint
        retry_after: Option<Duration>,
    },
    /// Integrity mismatch or revision conflict: the upload must be redone
    ReuploadNeeded,
    /// Our own bookkeeping is stale (e.g. missing node mapping)
    ClientState,
    /// Definitive rejection: retrying cannot help
    Permanent,
}

/// Map a drive error to its retry class.
///
/// `NotFound` and `AlreadyTrashed` do not appear here: handlers treat them
/// as idempotent successes or as [`ErrorClass::ClientState`] depending on
/// the operation.
#[must_use]
pub fn classify(err: &DriveError) -> ErrorClass {
    match err {
        DriveError::Network(_) | DriveError::Timeout(_) => ErrorClass::TransientNetwork,
        DriveError::RateLimited { retry_after } => ErrorClass::RateLimited {
            retry_after: *retry_after,
        },
        DriveError::IntegrityMismatch(_) | DriveError::RevisionConflict(_) => {
            ErrorClass::ReuploadNeeded
        }
        DriveError::NotFound(_) | DriveError::AlreadyTrashed(_) => ErrorClass::ClientState,
        DriveError::Decrypt(_) | DriveError::Permanent { .. } => ErrorClass::Permanent,
    }
}

// ============================================================================
// Backoff policy
// ============================================================================

const TRANSIENT_CAP: Duration = Duration::from_secs(5 * 60);
const REUPLOAD_CAP: Duration = Duration::from_secs(2 * 60);
const RATE_LIMIT_DEFAULT: Duration = Duration::from_secs(30);
const CLIENT_STATE_DELAY: Duration = Duration::from_secs(5);

const REUPLOAD_MAX_RETRIES: u32 = 5;
const REUPLOAD_CONVERT_AT: u32 = 2;
const CLIENT_STATE_MAX_RETRIES: u32 = 3;

/// What the policy decided for one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay; optionally rewrite the job's kind.
    Retry {
        /// Wait before the next attempt
        delay: Duration,
        /// Kind rewrite applied with the retry (re-upload escalation)
        convert_to: Option<EventKind>,
    },
    /// Give up; block the job.
    Block,
}

/// Exponential `2^n * 1s` with a cap. 2^20 s already exceeds every cap.
fn exponential(n_retries: u32, cap: Duration) -> Duration {
    let secs = 2u64.saturating_pow(n_retries.min(20));
    Duration::from_secs(secs).min(cap)
}

/// Uniform jitter of +/-20% around `delay`.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor)
}

/// Decide the disposition of a failure, given how many retries the job has
/// already consumed.
#[must_use]
pub fn decide(class: &ErrorClass, n_retries: u32, job_kind: EventKind) -> RetryDecision {
    match class {
        ErrorClass::TransientNetwork => RetryDecision::Retry {
            delay: jittered(exponential(n_retries, TRANSIENT_CAP)),
            convert_to: None,
        },
        ErrorClass::RateLimited { retry_after } => RetryDecision::Retry {
            delay: retry_after.unwrap_or(RATE_LIMIT_DEFAULT),
            convert_to: None,
        },
        ErrorClass::ReuploadNeeded => {
            if n_retries >= REUPLOAD_MAX_RETRIES {
                return RetryDecision::Block;
            }
            // Repeated integrity failures mean revising in place is hopeless;
            // replace the remote node outright.
            let convert_to = (n_retries + 1 >= REUPLOAD_CONVERT_AT
                && job_kind != EventKind::DeleteAndCreate)
                .then_some(EventKind::DeleteAndCreate);
            RetryDecision::Retry {
                delay: exponential(n_retries, REUPLOAD_CAP),
                convert_to,
            }
        }
        ErrorClass::ClientState => {
            if n_retries >= CLIENT_STATE_MAX_RETRIES {
                RetryDecision::Block
            } else {
                RetryDecision::Retry {
                    delay: CLIENT_STATE_DELAY,
                    convert_to: None,
                }
            }
        }
        ErrorClass::Permanent => RetryDecision::Block,
    }
}

// ============================================================================
// JobQueue
// ============================================================================

/// Store-backed queue operations with the retry policy applied.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn StateStore>,
}

impl JobQueue {
    /// Wrap the store.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Claim the oldest ready job, if any.
    pub async fn next_ready(&self) -> anyhow::Result<Option<SyncJob>> {
        self.store.claim_next_job(now_ms()).await
    }

    /// Complete a job together with its bookkeeping.
    pub async fn mark_synced(&self, id: i64, effects: CompletionEffects) -> anyhow::Result<()> {
        self.store.complete_job(id, effects).await
    }

    /// Apply the retry policy to a failed job.
    pub async fn schedule_retry(
        &self,
        job: &SyncJob,
        class: ErrorClass,
        message: String,
    ) -> anyhow::Result<()> {
        match decide(&class, job.n_retries, job.kind) {
            RetryDecision::Retry { delay, convert_to } => {
                let retry_at_ms = now_ms() + delay.as_millis() as i64;
                debug!(
                    job_id = job.id,
                    path = %job.local_path,
                    n_retries = job.n_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    converted = convert_to.is_some(),
                    error = %message,
                    "Scheduling retry"
                );
                self.store
                    .fail_job(
                        job.id,
                        FailureDisposition::Retry {
                            retry_at_ms,
                            error: message,
                            convert_to,
                        },
                    )
                    .await
            }
            RetryDecision::Block => self.mark_blocked(job, message).await,
        }
    }

    /// Terminal failure; surfaced to the operator via the status interface.
    pub async fn mark_blocked(&self, job: &SyncJob, message: String) -> anyhow::Result<()> {
        warn!(
            job_id = job.id,
            path = %job.local_path,
            kind = %job.kind,
            error = %message,
            "Job blocked"
        );
        self.store
            .fail_job(job.id, FailureDisposition::Block { error: message })
            .await
    }
}

// ============================================================================
// Tests
// ============================================================================
