//! Backup File Manager: manifest upkeep, retention, and corruption scans

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::manifest::{BackupManifest, MANIFEST_NAME};
use super::naming::{
    backup_file_name, parse_backup_file_name_with_prefix, DEFAULT_EXTENSION, DEFAULT_PREFIX,
};
use super::retention::select_for_deletion;
use crate::crypto::CryptoEngine;
use crate::error::{IntegrityErrorKind, StorageErrorKind};
use crate::models::{BackupFileMetadata, BackupType, RetentionPolicy, SNAPSHOT_VERSION};
use crate::storage::{BlobTransport, RemoteFile};
use crate::{Error, Result};

/// Everything known about a freshly uploaded backup blob
#[derive(Debug, Clone)]
pub struct BackupUpload {
    pub file_id: String,
    pub file_name: String,
    pub device_id: String,
    pub backup_type: BackupType,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
    pub checksum: String,
    pub additional_data: Map<String, Value>,
}

/// Aggregate view of this clinic's backups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStatistics {
    pub total_backups: usize,
    pub total_size: u64,
    pub by_type: BTreeMap<String, usize>,
    pub by_device: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Why an entry was flagged by [`BackupFileManager::detect_corrupted_backups`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionReason {
    Missing,
    SizeMismatch,
    ChecksumMismatch,
    MarkedBad,
}

/// Manifest entry that failed a corruption scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorruptedBackup {
    pub metadata: BackupFileMetadata,
    pub reason: CorruptionReason,
}

/// Manifest as read from the transport
struct StoredManifest {
    manifest: BackupManifest,
    id: Option<String>,
    readable: bool,
}

/// Owns the manifest blob and the backup set of one clinic.
pub struct BackupFileManager<T> {
    transport: T,
    clinic_id: String,
    prefix: String,
    extension: String,
    policy: RetentionPolicy,
    corrupted: Mutex<HashSet<String>>,
    manifest_lock: Mutex<()>,
}

impl<T: BlobTransport> BackupFileManager<T> {
    pub fn new(transport: T, clinic_id: impl Into<String>, policy: RetentionPolicy) -> Self {
        Self {
            transport,
            clinic_id: clinic_id.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
            policy,
            corrupted: Mutex::new(HashSet::new()),
            manifest_lock: Mutex::new(()),
        }
    }

    /// Override the blob name prefix and extension.
    #[must_use]
    pub fn with_naming(mut self, prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self.extension = extension.into();
        self
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub fn clinic_id(&self) -> &str {
        &self.clinic_id
    }

    pub const fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Blob name for a backup of this clinic taken at `timestamp`.
    pub fn file_name_for(&self, timestamp: DateTime<Utc>) -> String {
        backup_file_name(&self.prefix, &self.clinic_id, timestamp, &self.extension)
    }

    /// The manifest as stored; missing or unreadable manifests read as empty.
    pub async fn manifest(&self) -> Result<BackupManifest> {
        let listing = self.transport.list().await?;
        Ok(self.read_manifest(&listing).await?.manifest)
    }

    /// Reconcile the manifest with the live listing and persist any change.
    pub async fn organize_backup_files(&self) -> Result<BackupManifest> {
        let _guard = self.manifest_lock.lock().await;
        let listing = self.transport.list().await?;
        Ok(self.organize_locked(&listing).await?.0)
    }

    /// Add or replace a manifest entry for an uploaded blob.
    pub async fn register_backup_file(&self, upload: BackupUpload) -> Result<BackupFileMetadata> {
        let entry = BackupFileMetadata {
            file_id: upload.file_id,
            file_name: upload.file_name,
            clinic_id: self.clinic_id.clone(),
            device_id: upload.device_id,
            backup_timestamp: upload.timestamp,
            backup_type: upload.backup_type,
            version: SNAPSHOT_VERSION,
            size: upload.size,
            checksum: upload.checksum,
            additional_data: upload.additional_data,
        };

        let _guard = self.manifest_lock.lock().await;
        let listing = self.transport.list().await?;
        let StoredManifest {
            mut manifest, id, ..
        } = self.read_manifest(&listing).await?;
        manifest.upsert(entry.clone());
        self.write_manifest(&mut manifest, id.as_deref()).await?;
        info!(
            "Registered {} backup {} ({} bytes)",
            entry.backup_type, entry.file_name, entry.size
        );
        Ok(entry)
    }

    /// This clinic's backups, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupFileMetadata>> {
        let manifest = self.manifest().await?;
        Ok(self.clinic_entries(manifest.files))
    }

    /// Delete backups the retention policy does not keep.
    ///
    /// Individual deletion failures are logged and skipped; the returned ids
    /// are the blobs actually removed.
    pub async fn enforce_retention_policy(&self) -> Result<Vec<String>> {
        let _guard = self.manifest_lock.lock().await;
        let listing = self.transport.list().await?;
        let (mut manifest, manifest_id) = self.organize_locked(&listing).await?;

        let ours: Vec<BackupFileMetadata> = manifest
            .files
            .iter()
            .filter(|file| file.clinic_id == self.clinic_id)
            .cloned()
            .collect();
        let doomed = select_for_deletion(&ours, &self.policy, Utc::now());
        if doomed.is_empty() {
            debug!("Retention kept all {} backups", ours.len());
            return Ok(Vec::new());
        }

        let mut deleted = Vec::new();
        for file_id in doomed {
            match self.transport.delete(&file_id).await {
                Ok(()) => deleted.push(file_id),
                Err(Error::Storage {
                    kind: StorageErrorKind::NotFound,
                    ..
                }) => deleted.push(file_id),
                Err(error) => warn!("Skipping deletion of backup {file_id}: {error}"),
            }
        }

        if !deleted.is_empty() {
            manifest.remove_all(&deleted);
            self.write_manifest(&mut manifest, Some(&manifest_id))
                .await?;
        }
        info!("Retention deleted {} of {} backups", deleted.len(), ours.len());
        Ok(deleted)
    }

    /// Entries whose blob is missing, resized, fails its checksum, or was
    /// marked bad in this session.
    pub async fn detect_corrupted_backups(&self) -> Result<Vec<CorruptedBackup>> {
        let listing = self.transport.list().await?;
        let manifest = self.read_manifest(&listing).await?.manifest;
        let live: HashMap<&str, &RemoteFile> =
            listing.iter().map(|file| (file.id.as_str(), file)).collect();
        let marked = self.corrupted.lock().await.clone();

        let mut flagged = Vec::new();
        for entry in self.clinic_entries(manifest.files) {
            let reason = if marked.contains(&entry.file_id) {
                Some(CorruptionReason::MarkedBad)
            } else {
                match live.get(entry.file_id.as_str()) {
                    None => Some(CorruptionReason::Missing),
                    Some(file) if file.size != entry.size => Some(CorruptionReason::SizeMismatch),
                    Some(_) if entry.has_checksum() => {
                        let bytes = self.transport.download(&entry.file_id).await?;
                        (!CryptoEngine::validate_integrity(&bytes, &entry.checksum))
                            .then_some(CorruptionReason::ChecksumMismatch)
                    }
                    Some(_) => None,
                }
            };

            if let Some(reason) = reason {
                warn!("Backup {} is corrupted: {reason:?}", entry.file_name);
                flagged.push(CorruptedBackup {
                    metadata: entry,
                    reason,
                });
            }
        }
        Ok(flagged)
    }

    /// Remember that `file_id` failed to decode so later searches skip it.
    pub async fn mark_corrupted(&self, file_id: &str) {
        warn!("Marking backup {file_id} as corrupted");
        self.corrupted.lock().await.insert(file_id.to_string());
    }

    pub async fn is_marked_corrupted(&self, file_id: &str) -> bool {
        self.corrupted.lock().await.contains(file_id)
    }

    /// Valid backup closest in time to `target`.
    pub async fn find_nearest_valid_backup(
        &self,
        target: DateTime<Utc>,
    ) -> Result<Option<BackupFileMetadata>> {
        self.find_nearest_valid_backup_where(target, |_| true).await
    }

    /// Like [`Self::find_nearest_valid_backup`], restricted to entries matching
    /// `filter`. Equal distances prefer the newer backup.
    pub async fn find_nearest_valid_backup_where(
        &self,
        target: DateTime<Utc>,
        filter: impl Fn(&BackupFileMetadata) -> bool,
    ) -> Result<Option<BackupFileMetadata>> {
        let backups = self.list_backups().await?;
        let marked = self.corrupted.lock().await;
        Ok(backups
            .into_iter()
            .filter(|entry| !marked.contains(&entry.file_id) && filter(entry))
            .min_by(|a, b| {
                let distance_a = (a.backup_timestamp - target).abs();
                let distance_b = (b.backup_timestamp - target).abs();
                distance_a
                    .cmp(&distance_b)
                    .then_with(|| b.backup_timestamp.cmp(&a.backup_timestamp))
            }))
    }

    pub async fn get_backup_statistics(&self) -> Result<BackupStatistics> {
        let backups = self.list_backups().await?;
        let mut stats = BackupStatistics {
            total_backups: backups.len(),
            ..BackupStatistics::default()
        };
        for entry in &backups {
            stats.total_size += entry.size;
            *stats
                .by_type
                .entry(entry.backup_type.as_str().to_string())
                .or_default() += 1;
            let device = if entry.device_id.is_empty() {
                "unknown"
            } else {
                entry.device_id.as_str()
            };
            *stats.by_device.entry(device.to_string()).or_default() += 1;
            stats.oldest = Some(
                stats
                    .oldest
                    .map_or(entry.backup_timestamp, |oldest| oldest.min(entry.backup_timestamp)),
            );
            stats.newest = Some(
                stats
                    .newest
                    .map_or(entry.backup_timestamp, |newest| newest.max(entry.backup_timestamp)),
            );
        }
        Ok(stats)
    }

    /// Download a backup blob and check it against its manifest entry.
    pub async fn download_verified(&self, entry: &BackupFileMetadata) -> Result<Vec<u8>> {
        let bytes = self.transport.download(&entry.file_id).await?;
        if bytes.len() as u64 != entry.size {
            return Err(Error::integrity(
                IntegrityErrorKind::CorruptedData,
                format!(
                    "backup {} is {} bytes, manifest records {}",
                    entry.file_name,
                    bytes.len(),
                    entry.size
                ),
            ));
        }
        if entry.has_checksum() && !CryptoEngine::validate_integrity(&bytes, &entry.checksum) {
            return Err(Error::integrity(
                IntegrityErrorKind::ChecksumMismatch,
                format!("backup {} does not match its recorded checksum", entry.file_name),
            ));
        }
        Ok(bytes)
    }

    fn clinic_entries(&self, files: Vec<BackupFileMetadata>) -> Vec<BackupFileMetadata> {
        let mut ours: Vec<BackupFileMetadata> = files
            .into_iter()
            .filter(|file| file.clinic_id == self.clinic_id)
            .collect();
        ours.sort_by(|a, b| b.backup_timestamp.cmp(&a.backup_timestamp));
        ours
    }

    async fn read_manifest(&self, listing: &[RemoteFile]) -> Result<StoredManifest> {
        let Some(file) = listing.iter().find(|file| file.name == MANIFEST_NAME) else {
            debug!("No manifest found, starting empty");
            return Ok(StoredManifest {
                manifest: BackupManifest::default(),
                id: None,
                readable: true,
            });
        };

        let bytes = self.transport.download(&file.id).await?;
        let (manifest, readable) = match BackupManifest::from_bytes(&bytes) {
            Ok(manifest) => (manifest, true),
            Err(error) => {
                warn!("Manifest is unreadable, rebuilding from listing: {error}");
                (BackupManifest::default(), false)
            }
        };
        Ok(StoredManifest {
            manifest,
            id: Some(file.id.clone()),
            readable,
        })
    }

    /// Upload or replace the manifest blob, returning its id.
    async fn write_manifest(
        &self,
        manifest: &mut BackupManifest,
        manifest_id: Option<&str>,
    ) -> Result<String> {
        manifest.touch();
        let bytes = manifest.to_bytes()?;
        let id = match manifest_id {
            Some(id) => self.transport.update(id, MANIFEST_NAME, &bytes).await?,
            None => self.transport.upload(MANIFEST_NAME, &bytes).await?,
        };
        debug!("Wrote manifest with {} entries", manifest.files.len());
        Ok(id)
    }

    /// Reconciled manifest and the id of its (possibly new) blob.
    async fn organize_locked(&self, listing: &[RemoteFile]) -> Result<(BackupManifest, String)> {
        let StoredManifest {
            mut manifest,
            id: manifest_id,
            readable,
        } = self.read_manifest(listing).await?;
        let live: HashSet<&str> = listing.iter().map(|file| file.id.as_str()).collect();

        let vanished: Vec<String> = manifest
            .files
            .iter()
            .filter(|file| !live.contains(file.file_id.as_str()))
            .map(|file| file.file_id.clone())
            .collect();
        let dropped = manifest.remove_all(&vanished);

        let mut adopted = 0;
        for file in listing {
            if manifest.get(&file.id).is_some() {
                continue;
            }
            let Some(parsed) = parse_backup_file_name_with_prefix(&self.prefix, &file.name) else {
                continue;
            };
            if parsed.extension != self.extension {
                continue;
            }
            let mut additional_data = Map::new();
            additional_data.insert("adopted".to_string(), Value::Bool(true));
            manifest.upsert(BackupFileMetadata {
                file_id: file.id.clone(),
                file_name: file.name.clone(),
                clinic_id: parsed.clinic_id,
                device_id: String::new(),
                backup_timestamp: parsed.timestamp,
                backup_type: BackupType::Full,
                version: SNAPSHOT_VERSION,
                size: file.size,
                checksum: String::new(),
                additional_data,
            });
            adopted += 1;
        }

        if dropped > 0 || adopted > 0 {
            info!("Manifest reconciled: {dropped} dropped, {adopted} adopted");
        }
        let manifest_id = match manifest_id {
            Some(id) if readable && dropped == 0 && adopted == 0 => id,
            id => self.write_manifest(&mut manifest, id.as_deref()).await?,
        };
        Ok((manifest, manifest_id))
    }
}
