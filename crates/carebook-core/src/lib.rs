//! carebook-core - Core library for Carebook
//!
//! Clinic records live in a local store and travel between devices as
//! compressed, encrypted snapshots in a shared blob mailbox. This crate holds
//! the models, the store and transport backends, the crypto and compression
//! engines, backup bookkeeping, and the sync orchestrator used by the CLI.

pub mod backup;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod storage;
pub mod store;
pub mod sync;

pub use error::{Error, ErrorCategory, Result};
pub use models::{BackupFileMetadata, SyncConflict, SyncableRecord};
pub use sync::{SyncOrchestrator, SyncOutcome};
