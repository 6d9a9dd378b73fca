//! Sync engine: conflict handling, retry policy, state tracking, and the
//! orchestrator that ties the store to remote backups.

mod conflict;
mod orchestrator;
mod outcome;
mod retry;
mod state;

pub use conflict::{last_write_wins, ConflictDetection, ConflictResolver, Decision};
pub use orchestrator::{OrchestratorConfig, SyncOrchestrator};
pub use outcome::{SyncFailure, SyncOperation, SyncOutcome, SyncReport, TableReport};
pub use retry::RetryConfig;
pub use state::{OperationGuard, StatusTracker, SyncEvent, SyncPhase, SyncState};
