//! Shared manifest blob listing every known backup file

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, IntegrityErrorKind, Result};
use crate::models::BackupFileMetadata;

/// Blob name of the manifest
pub const MANIFEST_NAME: &str = "backup_metadata.json";
/// Manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// `{version, updated_at, files}`, rewritten wholesale on every change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub files: Vec<BackupFileMetadata>,
}

impl Default for BackupManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            updated_at: Utc::now(),
            files: Vec::new(),
        }
    }
}

impl BackupManifest {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes).map_err(|error| {
            Error::integrity(
                IntegrityErrorKind::InvalidFormat,
                format!("manifest is not valid JSON: {error}"),
            )
        })?;
        if manifest.version > MANIFEST_VERSION {
            return Err(Error::integrity(
                IntegrityErrorKind::VersionMismatch,
                format!("manifest version {} is not supported", manifest.version),
            ));
        }
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    #[must_use]
    pub fn get(&self, file_id: &str) -> Option<&BackupFileMetadata> {
        self.files.iter().find(|file| file.file_id == file_id)
    }

    /// Insert or replace by file id, keeping files ordered by timestamp.
    pub fn upsert(&mut self, entry: BackupFileMetadata) {
        self.files.retain(|file| file.file_id != entry.file_id);
        self.files.push(entry);
        self.files.sort_by(|a, b| {
            a.backup_timestamp
                .cmp(&b.backup_timestamp)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
    }

    /// Remove entries by id; returns how many were removed.
    pub fn remove_all(&mut self, file_ids: &[String]) -> usize {
        let before = self.files.len();
        self.files.retain(|file| !file_ids.contains(&file.file_id));
        before - self.files.len()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
