//! Port definitions (driven/secondary ports)
//!
//! Traits at the seams of the sync engine. Adapters live in other crates
//! (`pdsync-store` for the state store) or outside this repository
//! entirely (the real drive client and login flow).

pub mod auth_provider;
pub mod drive_client;
pub mod state_store;

pub use auth_provider::{AuthError, AuthProvider};
pub use drive_client::{
    ChildPage, DriveClient, DriveError, FileMeta, NodeKind, RelocateRequest, RemoteNode,
    RevisionInfo,
};
pub use state_store::{
    CompletionEffects, FailureDisposition, NodeMappingRecord, QueueStats, StateStore,
};
