//! Per-table sync bookkeeping

use serde::{Deserialize, Serialize};

/// Denormalized per-table cache owned by the record store.
///
/// `pending_changes_count` equals the number of pending records and
/// `conflict_count` the number of pending conflicts of the table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub table: String,
    /// Marker of the last successful push (Unix ms)
    pub last_sync_timestamp: Option<i64>,
    /// Timestamp of the last uploaded backup (Unix ms)
    pub last_backup_timestamp: Option<i64>,
    pub pending_changes_count: u64,
    pub conflict_count: u64,
}

impl SyncMetadata {
    #[must_use]
    pub fn empty(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }
}

/// Timestamps the orchestrator may set; counters are maintained by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMetadataUpdate {
    pub last_sync_timestamp: Option<i64>,
    pub last_backup_timestamp: Option<i64>,
}

impl SyncMetadataUpdate {
    #[must_use]
    pub const fn synced_at(timestamp: i64) -> Self {
        Self {
            last_sync_timestamp: Some(timestamp),
            last_backup_timestamp: None,
        }
    }

    #[must_use]
    pub const fn with_backup_at(mut self, timestamp: i64) -> Self {
        self.last_backup_timestamp = Some(timestamp);
        self
    }

    /// Apply onto existing metadata, leaving unset fields untouched.
    pub fn apply_to(self, metadata: &mut SyncMetadata) {
        if let Some(timestamp) = self.last_sync_timestamp {
            metadata.last_sync_timestamp = Some(timestamp);
        }
        if let Some(timestamp) = self.last_backup_timestamp {
            metadata.last_backup_timestamp = Some(timestamp);
        }
    }
}
