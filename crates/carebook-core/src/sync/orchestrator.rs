//! Sync Orchestrator
//!
//! Drives pull, merge, push, backup, and restore against a record store and a
//! blob transport. Every public operation returns a [`SyncOutcome`]; only one
//! operation runs at a time per orchestrator.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conflict::ConflictResolver;
use super::outcome::{SyncOperation, SyncOutcome, SyncReport};
use super::retry::RetryConfig;
use super::state::{OperationGuard, StatusTracker, SyncEvent, SyncPhase, SyncState};
use crate::backup::{BackupFileManager, BackupUpload};
use crate::compression::{CompressedPayload, CompressionEngine};
use crate::crypto::{CryptoEngine, EncryptedPayload, EncryptionKey, KeyRing};
use crate::error::{ConflictErrorKind, IntegrityErrorKind, OperationErrorKind, StorageErrorKind};
use crate::models::{
    tables_from_records, BackupFileMetadata, BackupSnapshot, BackupType, ConflictResolution,
    SyncMetadataUpdate,
};
use crate::storage::BlobTransport;
use crate::store::RecordStore;
use crate::{Error, Result};

/// Identity and policy of one orchestrator instance
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub clinic_id: String,
    pub device_id: String,
    pub retry: RetryConfig,
    /// Enforce retention after every successful upload
    pub auto_retention: bool,
}

impl OrchestratorConfig {
    pub fn new(clinic_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            clinic_id: clinic_id.into(),
            device_id: device_id.into(),
            retry: RetryConfig::default(),
            auto_retention: true,
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_auto_retention(mut self, enabled: bool) -> Self {
        self.auto_retention = enabled;
        self
    }
}

/// Coordinates the local store, the crypto and compression engines, and the
/// backup manager.
pub struct SyncOrchestrator<S, T> {
    store: S,
    backups: BackupFileManager<T>,
    crypto: CryptoEngine,
    compression: CompressionEngine,
    resolver: ConflictResolver,
    config: OrchestratorConfig,
    status: StatusTracker,
    cancel: Mutex<CancellationToken>,
}

impl<S: RecordStore, T: BlobTransport> SyncOrchestrator<S, T> {
    pub fn new(
        store: S,
        backups: BackupFileManager<T>,
        crypto: CryptoEngine,
        compression: CompressionEngine,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            backups,
            crypto,
            compression,
            resolver: ConflictResolver::new(),
            config,
            status: StatusTracker::new(),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn backups(&self) -> &BackupFileManager<T> {
        &self.backups
    }

    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn status(&self) -> SyncState {
        self.status.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.status.subscribe()
    }

    /// Cancel the running operation, if any.
    pub async fn cancel(&self) {
        let token = self.cancel.lock().await;
        if self.status.current() != SyncState::Idle {
            info!("Cancelling {}", self.status.current());
        }
        token.cancel();
    }

    /// Pull and merge every remote change, then upload a full snapshot.
    pub async fn perform_full_sync(&self) -> SyncOutcome {
        let (guard, cancel) = match self.begin(SyncState::Syncing).await {
            Ok(started) => started,
            Err(error) => return SyncOutcome::from_error(&error),
        };
        let result = self.sync(&guard, &cancel, BackupType::Full).await;
        conclude(guard, result)
    }

    /// Pull and merge, then upload only records changed since the last sync.
    pub async fn perform_incremental_sync(&self) -> SyncOutcome {
        let (guard, cancel) = match self.begin(SyncState::Syncing).await {
            Ok(started) => started,
            Err(error) => return SyncOutcome::from_error(&error),
        };
        let result = self.sync(&guard, &cancel, BackupType::Incremental).await;
        conclude(guard, result)
    }

    /// Upload a full snapshot without pulling first.
    pub async fn create_backup(&self) -> SyncOutcome {
        let (guard, cancel) = match self.begin(SyncState::BackingUp).await {
            Ok(started) => started,
            Err(error) => return SyncOutcome::from_error(&error),
        };
        let result = self.backup(&guard, &cancel).await;
        conclude(guard, result)
    }

    /// Replace local tables with the newest usable full backup.
    pub async fn restore_latest_backup(&self, confirmed: bool) -> SyncOutcome {
        self.restore_guarded(None, confirmed).await
    }

    /// Replace local tables with a specific full backup, falling back to the
    /// nearest usable one if it is damaged.
    pub async fn restore_from_backup(&self, file_id: &str, confirmed: bool) -> SyncOutcome {
        self.restore_guarded(Some(file_id), confirmed).await
    }

    /// Apply an explicit resolution to a pending conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ConflictResolution,
    ) -> SyncOutcome {
        let guard = match self.status.try_begin(SyncState::Syncing) {
            Ok(guard) => guard,
            Err(error) => return SyncOutcome::from_error(&error),
        };
        let result = self.resolve(conflict_id, resolution).await;
        conclude(guard, result)
    }

    /// Start a new key generation; older backups stay decryptable.
    pub async fn rotate_key(&self) -> SyncOutcome {
        let guard = match self.status.try_begin(SyncState::BackingUp) {
            Ok(guard) => guard,
            Err(error) => return SyncOutcome::from_error(&error),
        };
        let result = self.rotate().await;
        conclude(guard, result)
    }

    /// The persisted key ring, created with a first key when missing.
    pub async fn key_ring(&self) -> Result<KeyRing> {
        if let Some(ring) = self.store.load_key_ring().await? {
            if ring.active().is_some() {
                return Ok(ring);
            }
        }
        let ring = KeyRing::generate();
        self.store.save_key_ring(&ring).await?;
        info!("Generated first backup key");
        Ok(ring)
    }

    /// Enter `state` and install a fresh cancellation token.
    ///
    /// The token slot stays locked until both happened, so a `cancel()` that
    /// sees the new state always reaches the new token.
    async fn begin(
        &self,
        state: SyncState,
    ) -> Result<(OperationGuard<'_>, CancellationToken)> {
        let mut slot = self.cancel.lock().await;
        let guard = self.status.try_begin(state)?;
        let token = CancellationToken::new();
        *slot = token.clone();
        Ok((guard, token))
    }

    async fn sync(
        &self,
        guard: &OperationGuard<'_>,
        cancel: &CancellationToken,
        backup_type: BackupType,
    ) -> Result<SyncReport> {
        let operation = match backup_type {
            BackupType::Full => SyncOperation::FullSync,
            BackupType::Incremental => SyncOperation::IncrementalSync,
        };
        let started_at = Utc::now();
        let mut report = SyncReport::new(operation);

        let ring = self.key_ring().await?;
        self.pull(guard, cancel, &ring, &mut report).await?;
        checkpoint(cancel)?;

        let uploaded = self
            .push(guard, cancel, backup_type, started_at, &mut report)
            .await?;

        let marker = started_at.timestamp_millis();
        for table in self.store.tables() {
            if report.failed_tables.contains_key(table) {
                continue;
            }
            let update = SyncMetadataUpdate::synced_at(marker);
            let update = if uploaded.is_some() {
                update.with_backup_at(marker)
            } else {
                update
            };
            self.store.update_sync_metadata(table, update).await?;
        }

        if uploaded.is_some() {
            self.apply_retention(guard, &mut report).await;
        }
        report.uploaded = uploaded;
        Ok(report)
    }

    async fn backup(
        &self,
        guard: &OperationGuard<'_>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let started_at = Utc::now();
        let mut report = SyncReport::new(SyncOperation::Backup);

        let uploaded = self
            .push(guard, cancel, BackupType::Full, started_at, &mut report)
            .await?;
        // Backups do not confirm a pull, so the sync marker stays put.
        let update = SyncMetadataUpdate {
            last_sync_timestamp: None,
            last_backup_timestamp: Some(started_at.timestamp_millis()),
        };
        for table in self.store.tables() {
            self.store.update_sync_metadata(table, update).await?;
        }

        self.apply_retention(guard, &mut report).await;
        report.uploaded = uploaded;
        Ok(report)
    }

    /// Download and merge the newest full backup plus newer incrementals.
    async fn pull(
        &self,
        guard: &OperationGuard<'_>,
        cancel: &CancellationToken,
        ring: &KeyRing,
        report: &mut SyncReport,
    ) -> Result<()> {
        let backups = self.fetch_backups(guard, cancel).await?;
        let mut rejected: HashSet<String> = HashSet::new();

        let base = loop {
            let mut candidate = None;
            for entry in backups.iter().filter(|entry| entry.backup_type == BackupType::Full) {
                if !rejected.contains(&entry.file_id)
                    && !self.backups.is_marked_corrupted(&entry.file_id).await
                {
                    candidate = Some(entry);
                    break;
                }
            }
            let Some(entry) = candidate else {
                debug!("No full backup to pull");
                return Ok(());
            };

            checkpoint(cancel)?;
            guard.progress(SyncPhase::Downloading, entry.file_name.clone());
            match self.open_backup(entry, ring, cancel).await {
                Ok(snapshot) => {
                    self.merge_snapshot(guard, &snapshot, report).await?;
                    break entry;
                }
                Err(error) if is_unusable_backup(&error) => {
                    self.reject_backup(entry, &error, report).await;
                    rejected.insert(entry.file_id.clone());
                }
                Err(error) => return Err(error),
            }
        };

        let mut incrementals: Vec<&BackupFileMetadata> = backups
            .iter()
            .filter(|entry| {
                entry.backup_type == BackupType::Incremental
                    && entry.backup_timestamp > base.backup_timestamp
            })
            .collect();
        incrementals.sort_by_key(|entry| entry.backup_timestamp);

        for entry in incrementals {
            if self.backups.is_marked_corrupted(&entry.file_id).await {
                continue;
            }
            checkpoint(cancel)?;
            guard.progress(SyncPhase::Downloading, entry.file_name.clone());
            match self.open_backup(entry, ring, cancel).await {
                Ok(snapshot) => self.merge_snapshot(guard, &snapshot, report).await?,
                Err(error) if is_unusable_backup(&error) => {
                    self.reject_backup(entry, &error, report).await;
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    async fn merge_snapshot(
        &self,
        guard: &OperationGuard<'_>,
        snapshot: &BackupSnapshot,
        report: &mut SyncReport,
    ) -> Result<()> {
        guard.progress(
            SyncPhase::Merging,
            format!("{} records from {}", snapshot.record_count(), snapshot.device_id),
        );
        for table in self.store.tables() {
            let records = match snapshot.records(table) {
                Ok(records) => records,
                Err(error) => {
                    warn!("Skipping table {table} from {}: {error}", snapshot.device_id);
                    report.failed_tables.insert(table.clone(), error.to_string());
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }

            let detection = self.store.detect_conflicts(table, &records).await?;
            let applied = self
                .store
                .apply_remote_changes(table, &detection.to_apply)
                .await?;
            for conflict in &detection.conflicts {
                self.store.store_conflict(conflict).await?;
                report.conflict_ids.push(conflict.id.clone());
            }

            let counts = report.table_mut(table);
            counts.pulled += applied;
            counts.conflicts += detection.conflicts.len();
            counts.kept_local += detection.kept_local.len();
            counts.skipped += detection.skipped.len();
            debug!(
                "Merged {table}: {applied} applied, {} conflicts, {} kept local, {} skipped",
                detection.conflicts.len(),
                detection.kept_local.len(),
                detection.skipped.len()
            );
        }
        Ok(())
    }

    /// Build, seal, upload, and register a snapshot; `None` when there is
    /// nothing to push.
    async fn push(
        &self,
        guard: &OperationGuard<'_>,
        cancel: &CancellationToken,
        backup_type: BackupType,
        started_at: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<Option<BackupFileMetadata>> {
        guard.progress(SyncPhase::Exporting, backup_type.as_str());
        let mut records = Vec::new();
        let mut pending: BTreeMap<String, Vec<(String, i64)>> = BTreeMap::new();
        for table in self.store.tables() {
            let table_records = match backup_type {
                BackupType::Full => self.store.list_records(table).await?,
                BackupType::Incremental => {
                    let since = self.store.get_sync_metadata(table).await?.last_sync_timestamp;
                    self.store.get_changed_records(table, since).await?
                }
            };
            pending.insert(
                table.clone(),
                table_records
                    .iter()
                    .filter(|record| record.is_pending())
                    .map(|record| (record.id.clone(), record.last_modified))
                    .collect(),
            );
            report.table_mut(table).pushed = table_records.len();
            records.extend(table_records);
        }

        if backup_type == BackupType::Incremental && records.is_empty() {
            debug!("No local changes to push");
            return Ok(None);
        }

        let snapshot = BackupSnapshot::new(
            self.config.clinic_id.clone(),
            self.config.device_id.clone(),
            started_at,
            backup_type,
            tables_from_records(self.store.tables(), &records),
        )?;
        checkpoint(cancel)?;

        guard.progress(
            SyncPhase::Encoding,
            format!("{} records", snapshot.record_count()),
        );
        let mut ring = self.key_ring().await?;
        let key = ring.active_key(&self.crypto, &self.config.clinic_id)?;
        let mut additional_data = Map::new();
        additional_data.insert("key_id".to_string(), Value::from(key.id()));
        additional_data.insert(
            "record_counts".to_string(),
            Value::Object(
                snapshot
                    .tables
                    .iter()
                    .map(|(table, payloads)| (table.clone(), Value::from(payloads.len())))
                    .collect(),
            ),
        );
        let timestamp = snapshot.timestamp;
        let (blob, algorithm) = self.seal_snapshot(snapshot, key).await?;
        additional_data.insert("compression".to_string(), Value::from(algorithm));
        checkpoint(cancel)?;

        let name = self.backups.file_name_for(timestamp);
        guard.progress(SyncPhase::Uploading, format!("{name} ({} bytes)", blob.len()));
        let file_id = self
            .config
            .retry
            .run("upload", cancel, || {
                self.backups.transport().upload(&name, &blob)
            })
            .await?;
        // Past this point a cancellation leaves an orphan the next organize pass adopts.
        checkpoint(cancel)?;

        guard.progress(SyncPhase::Registering, name.clone());
        let upload = BackupUpload {
            file_id,
            file_name: name,
            device_id: self.config.device_id.clone(),
            backup_type,
            timestamp,
            size: blob.len() as u64,
            checksum: CryptoEngine::checksum(&blob),
            additional_data,
        };
        let entry = self
            .config
            .retry
            .run("register", cancel, || {
                self.backups.register_backup_file(upload.clone())
            })
            .await?;

        for (table, versions) in &pending {
            if !versions.is_empty() {
                self.store.mark_records_synced(table, versions).await?;
            }
        }
        Ok(Some(entry))
    }

    async fn restore_guarded(&self, file_id: Option<&str>, confirmed: bool) -> SyncOutcome {
        if !confirmed {
            return SyncOutcome::from_error(&Error::operation(
                OperationErrorKind::InvalidState,
                "restore replaces every local record and must be confirmed",
            ));
        }
        let (guard, cancel) = match self.begin(SyncState::Restoring).await {
            Ok(started) => started,
            Err(error) => return SyncOutcome::from_error(&error),
        };
        let result = self.restore(&guard, &cancel, file_id).await;
        conclude(guard, result)
    }

    async fn restore(
        &self,
        guard: &OperationGuard<'_>,
        cancel: &CancellationToken,
        file_id: Option<&str>,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::new(SyncOperation::Restore);
        let backups = self.fetch_backups(guard, cancel).await?;

        let mut candidate = match file_id {
            Some(file_id) => {
                let entry = backups
                    .iter()
                    .find(|entry| entry.file_id == file_id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("backup {file_id}")))?;
                if entry.backup_type != BackupType::Full {
                    return Err(Error::operation(
                        OperationErrorKind::InvalidState,
                        format!("{} is incremental; only full backups can be restored", entry.file_name),
                    ));
                }
                Some(entry)
            }
            None => {
                let mut newest = None;
                for entry in backups.iter().filter(|entry| entry.backup_type == BackupType::Full) {
                    if !self.backups.is_marked_corrupted(&entry.file_id).await {
                        newest = Some(entry.clone());
                        break;
                    }
                }
                newest
            }
        };

        let ring = self.key_ring().await?;
        while let Some(entry) = candidate.take() {
            checkpoint(cancel)?;
            guard.progress(SyncPhase::Downloading, entry.file_name.clone());
            let opened = self
                .open_backup(&entry, &ring, cancel)
                .await
                .and_then(|snapshot| require_full(&entry, snapshot));

            match opened {
                Ok(snapshot) => {
                    self.import(guard, &snapshot, &mut report).await?;
                    report.restored = Some(entry);
                    return Ok(report);
                }
                Err(error) if is_unusable_backup(&error) => {
                    self.reject_backup(&entry, &error, &mut report).await;
                    candidate = self
                        .config
                        .retry
                        .run("find fallback", cancel, || {
                            self.backups.find_nearest_valid_backup_where(
                                entry.backup_timestamp,
                                |other| other.backup_type == BackupType::Full,
                            )
                        })
                        .await?;
                    if let Some(next) = &candidate {
                        info!("Falling back to backup {}", next.file_name);
                    }
                }
                Err(error) => return Err(error),
            }
        }

        if report.skipped_backups.is_empty() {
            Err(Error::NotFound(format!(
                "no full backup available for clinic {}",
                self.config.clinic_id
            )))
        } else {
            Err(Error::integrity(
                IntegrityErrorKind::CorruptedData,
                format!(
                    "no usable full backup remains ({} rejected)",
                    report.skipped_backups.len()
                ),
            ))
        }
    }

    async fn import(
        &self,
        guard: &OperationGuard<'_>,
        snapshot: &BackupSnapshot,
        report: &mut SyncReport,
    ) -> Result<()> {
        guard.progress(
            SyncPhase::Importing,
            format!("{} records", snapshot.record_count()),
        );
        let imported = self.store.import_snapshot(&snapshot.tables).await?;
        let marker = snapshot.timestamp.timestamp_millis();
        for table in self.store.tables() {
            report.table_mut(table).pulled = snapshot.tables.get(table).map_or(0, Vec::len);
            self.store
                .update_sync_metadata(table, SyncMetadataUpdate::synced_at(marker))
                .await?;
        }
        info!("Imported {imported} records from {}", snapshot.device_id);
        Ok(())
    }

    async fn resolve(
        &self,
        conflict_id: &str,
        resolution: ConflictResolution,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::new(SyncOperation::ResolveConflict);
        let conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        if !conflict.is_pending() {
            return Err(Error::conflict(
                ConflictErrorKind::InvalidResolution,
                format!("conflict {conflict_id} is already resolved"),
            ));
        }

        let record = self
            .resolver
            .resolve(&conflict, resolution, &self.config.device_id)?;
        let resolved = self
            .store
            .resolve_conflict(conflict_id, resolution, &record)
            .await?;
        report.notes.push(format!(
            "{}/{} resolved with {resolution}",
            resolved.table, resolved.record_id
        ));
        Ok(report)
    }

    async fn rotate(&self) -> Result<SyncReport> {
        let mut report = SyncReport::new(SyncOperation::RotateKey);
        let mut ring = self.store.load_key_ring().await?.unwrap_or_default();
        let key_id = ring.rotate().key_id.clone();
        self.store.save_key_ring(&ring).await?;
        info!("Rotated backup key to {key_id}");
        report.notes.push(format!("active key is now {key_id}"));
        Ok(report)
    }

    async fn fetch_backups(
        &self,
        guard: &OperationGuard<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<BackupFileMetadata>> {
        guard.progress(SyncPhase::Organizing, self.config.clinic_id.clone());
        self.config
            .retry
            .run("organize", cancel, || self.backups.organize_backup_files())
            .await?;
        self.config
            .retry
            .run("list", cancel, || self.backups.list_backups())
            .await
    }

    /// Download, verify, decrypt, and decode one backup.
    async fn open_backup(
        &self,
        entry: &BackupFileMetadata,
        ring: &KeyRing,
        cancel: &CancellationToken,
    ) -> Result<BackupSnapshot> {
        let blob = self
            .config
            .retry
            .run("download", cancel, || self.backups.download_verified(entry))
            .await?;
        let payload = EncryptedPayload::from_bytes(&blob)?;
        let key = self
            .crypto
            .key_for_payload(&self.config.clinic_id, &payload, ring)?;

        let crypto = self.crypto.clone();
        let compression = self.compression;
        let snapshot = tokio::task::spawn_blocking(move || -> Result<BackupSnapshot> {
            let envelope = crypto.decrypt(&payload, &key)?;
            let compressed = CompressedPayload::from_bytes(&envelope)?;
            let snapshot: BackupSnapshot = compression.decompress_json(&compressed)?;
            snapshot.verify()?;
            Ok(snapshot)
        })
        .await
        .map_err(|error| Error::Io(std::io::Error::other(error)))??;

        if snapshot.clinic_id != self.config.clinic_id {
            return Err(Error::integrity(
                IntegrityErrorKind::InvalidFormat,
                format!(
                    "backup {} belongs to clinic {}",
                    entry.file_name, snapshot.clinic_id
                ),
            ));
        }
        Ok(snapshot)
    }

    /// Compress and encrypt off the async executor.
    async fn seal_snapshot(
        &self,
        snapshot: BackupSnapshot,
        key: EncryptionKey,
    ) -> Result<(Vec<u8>, &'static str)> {
        let crypto = self.crypto.clone();
        let compression = self.compression;
        tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, &'static str)> {
            let compressed = compression.compress_json(&snapshot, None)?;
            debug!(
                "Compressed snapshot with {} ({:.2} ratio)",
                compressed.algorithm,
                compressed.ratio()
            );
            let envelope = compressed.to_bytes()?;
            let sealed = crypto.encrypt(&envelope, &key)?;
            Ok((sealed.to_bytes()?, compressed.algorithm.as_str()))
        })
        .await
        .map_err(|error| Error::Io(std::io::Error::other(error)))?
    }

    async fn reject_backup(&self, entry: &BackupFileMetadata, error: &Error, report: &mut SyncReport) {
        warn!("Backup {} is unusable: {error}", entry.file_name);
        self.backups.mark_corrupted(&entry.file_id).await;
        report.skipped_backups.push(entry.file_id.clone());
    }

    async fn apply_retention(&self, guard: &OperationGuard<'_>, report: &mut SyncReport) {
        if !self.config.auto_retention {
            return;
        }
        guard.progress(SyncPhase::Retention, self.backups.clinic_id().to_string());
        match self.backups.enforce_retention_policy().await {
            Ok(deleted) => report.retention_deleted = deleted,
            Err(error) => warn!("Retention pass failed: {error}"),
        }
    }
}

fn conclude(guard: OperationGuard<'_>, result: Result<SyncReport>) -> SyncOutcome {
    match result {
        Ok(report) => {
            guard.finish(false);
            let outcome = SyncOutcome::from_report(report);
            info!("{}", outcome.message());
            outcome
        }
        Err(error) => {
            let cancelled = error.is_cancelled();
            guard.finish(!cancelled);
            if cancelled {
                info!("Operation cancelled");
            } else {
                warn!("Operation failed: {error}");
            }
            SyncOutcome::from_error(&error)
        }
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::cancelled())
    } else {
        Ok(())
    }
}

/// Damaged or vanished backups are skipped in favour of another one.
const fn is_unusable_backup(error: &Error) -> bool {
    error.is_integrity()
        || matches!(
            error,
            Error::Storage {
                kind: StorageErrorKind::NotFound,
                ..
            }
        )
}

fn require_full(entry: &BackupFileMetadata, snapshot: BackupSnapshot) -> Result<BackupSnapshot> {
    if snapshot.backup_type() == BackupType::Full {
        Ok(snapshot)
    } else {
        Err(Error::integrity(
            IntegrityErrorKind::InvalidFormat,
            format!("backup {} holds an incremental snapshot", entry.file_name),
        ))
    }
}
