//! Data models for Carebook sync

mod backup_file;
mod record;
mod snapshot;
mod sync_conflict;
mod sync_metadata;

pub use backup_file::{BackupFileMetadata, BackupType, RetentionPolicy};
pub use record::{
    validate_business_fields, RecordPayload, SyncStatus, SyncableRecord, RESERVED_FIELDS,
};
pub use snapshot::{tables_from_records, BackupSnapshot, SnapshotTables, SNAPSHOT_VERSION};
pub use sync_conflict::{ConflictResolution, ConflictType, ResolutionStatus, SyncConflict};
pub use sync_metadata::{SyncMetadata, SyncMetadataUpdate};
