//! Backup File Manager
//!
//! Tracks uploaded backup blobs in a shared manifest, applies the retention
//! policy, and finds a usable backup when the newest one is damaged.

mod manager;
mod manifest;
mod naming;
mod retention;

pub use manager::{
    BackupFileManager, BackupStatistics, BackupUpload, CorruptedBackup, CorruptionReason,
};
pub use manifest::{BackupManifest, MANIFEST_NAME, MANIFEST_VERSION};
pub use naming::{
    backup_file_name, parse_backup_file_name, parse_backup_file_name_with_prefix,
    ParsedBackupName, DEFAULT_EXTENSION, DEFAULT_PREFIX,
};
pub use retention::select_for_deletion;
