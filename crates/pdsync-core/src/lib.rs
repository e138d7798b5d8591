//! pdsync Core - Domain model and port definitions
//!
//! This crate contains the sync engine's hexagonal core:
//! - Domain newtypes (paths, node identifiers, change tokens, hashes)
//! - The durable job model and its coalescing rules
//! - Typed configuration with validation
//! - Port traits for the state store, the remote drive and authentication

pub mod config;
pub mod domain;
pub mod ports;
