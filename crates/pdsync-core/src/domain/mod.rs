//! Domain layer: entities, newtypes and invariant-preserving logic.

pub mod change;
pub mod errors;
pub mod job;
pub mod newtypes;
pub mod signal;

pub use change::FileChange;
pub use errors::DomainError;
pub use job::{coalesce, Coalesced, EventKind, JobState, NewJob, SyncJob};
pub use newtypes::{ChangeToken, ContentHash, LocalPath, NodeUid, RemotePath};
pub use signal::ControlSignal;
