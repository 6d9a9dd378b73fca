//! Conflict detection and last-write-wins resolution.
//!
//! Detection compares each incoming remote record with the local version and
//! the version this device last synced for that record. It never fails:
//! conflicts are returned as data.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{Error, IntegrityErrorKind, Result};
use crate::models::{ConflictResolution, ConflictType, SyncConflict, SyncableRecord};

/// What to do with one remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No local version, or the local side did not change: take the remote.
    ApplyRemote,
    /// Remote is the same version or older than the local synced version.
    Skip,
    /// Only the local side changed; it will be pushed.
    KeepLocal,
    /// Both sides changed since the last synced version.
    Conflict(ConflictType),
}

/// Result of comparing a batch of remote records with local state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictDetection {
    /// Remote records to write locally (clean pulls and LWW winners)
    pub to_apply: Vec<SyncableRecord>,
    /// Pending conflicts to persist
    pub conflicts: Vec<SyncConflict>,
    /// Ids whose local version was kept
    pub kept_local: Vec<String>,
    /// Ids whose remote version was identical or stale
    pub skipped: Vec<String>,
}

impl ConflictDetection {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Stateless comparison rules shared by every record store.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Classify one remote record against its local counterpart.
    ///
    /// Both sides are compared with the local record's `synced_version`, so
    /// device clocks are never compared with each other except to pick a
    /// last-write-wins winner.
    #[must_use]
    pub fn classify(&self, local: Option<&SyncableRecord>, remote: &SyncableRecord) -> Decision {
        let Some(local) = local else {
            return Decision::ApplyRemote;
        };

        if local.last_modified == remote.last_modified {
            return Decision::Skip;
        }

        let local_changed = local.has_unsynced_changes();

        // Edits from one device are sequential, so the newer one supersedes.
        if !local_changed || local.device_id == remote.device_id {
            return match remote.last_modified.cmp(&local.last_modified) {
                Ordering::Greater => Decision::ApplyRemote,
                _ if local_changed => Decision::KeepLocal,
                _ => Decision::Skip,
            };
        }

        // Edits always move past the version they started from.
        let remote_changed = local
            .synced_version
            .is_none_or(|version| remote.last_modified > version);
        if !remote_changed {
            return Decision::KeepLocal;
        }

        let conflict_type = if local.is_deleted || remote.is_deleted {
            ConflictType::Delete
        } else if local.synced_version.is_none() {
            ConflictType::Create
        } else {
            ConflictType::Update
        };
        Decision::Conflict(conflict_type)
    }

    /// Compare a batch of remote records with local records of `table`.
    ///
    /// Conflicting records are resolved provisionally by last-write-wins:
    /// a winning remote lands in `to_apply`, a winning local stays pending.
    /// The conflict itself stays pending until resolved explicitly.
    #[must_use]
    pub fn detect_conflicts(
        &self,
        table: &str,
        remote_records: &[SyncableRecord],
        local_records: &HashMap<String, SyncableRecord>,
    ) -> ConflictDetection {
        let mut detection = ConflictDetection::default();

        for remote in remote_records {
            let local = local_records.get(&remote.id);
            match self.classify(local, remote) {
                Decision::ApplyRemote => detection.to_apply.push(as_synced(remote)),
                Decision::Skip => detection.skipped.push(remote.id.clone()),
                Decision::KeepLocal => detection.kept_local.push(remote.id.clone()),
                Decision::Conflict(conflict_type) => {
                    let Some(local) = local else { continue };
                    tracing::debug!(
                        "Conflict ({conflict_type}) on {table}/{}: local {} vs remote {}",
                        remote.id,
                        local.last_modified,
                        remote.last_modified
                    );
                    detection.conflicts.push(SyncConflict::new(
                        table,
                        remote.id.clone(),
                        local.to_payload(),
                        remote.to_payload(),
                        conflict_type,
                    ));
                    if std::ptr::eq(last_write_wins(local, remote), remote) {
                        detection.to_apply.push(as_synced(remote));
                    } else {
                        detection.kept_local.push(remote.id.clone());
                    }
                }
            }
        }

        detection
    }

    /// Record to store locally for an explicit resolution.
    ///
    /// Whenever the local side wins it is re-marked pending with a fresh
    /// timestamp so the next push, full or incremental, propagates it.
    pub fn resolve(
        &self,
        conflict: &SyncConflict,
        resolution: ConflictResolution,
        device_id: &str,
    ) -> Result<SyncableRecord> {
        let local = SyncableRecord::from_payload(&conflict.table, &conflict.local_data)?;
        let remote = SyncableRecord::from_payload(&conflict.table, &conflict.remote_data)?;
        if local.id != remote.id {
            return Err(Error::integrity(
                IntegrityErrorKind::CorruptedData,
                format!("conflict {} mixes records '{}' and '{}'", conflict.id, local.id, remote.id),
            ));
        }

        let resolved = match resolution {
            ConflictResolution::KeepRemote => as_synced(&remote),
            ConflictResolution::LastWriteWins
                if std::ptr::eq(last_write_wins(&local, &remote), &remote) =>
            {
                as_synced(&remote)
            }
            ConflictResolution::KeepLocal | ConflictResolution::LastWriteWins => {
                // The remote version has been seen; the local one overrides it.
                let mut record = local;
                record.touch(device_id);
                record.synced_version = Some(remote.last_modified);
                record
            }
        };
        Ok(resolved)
    }
}

/// Later `last_modified` wins; equal timestamps go to the greater device id.
#[must_use]
pub fn last_write_wins<'a>(
    local: &'a SyncableRecord,
    remote: &'a SyncableRecord,
) -> &'a SyncableRecord {
    match local
        .last_modified
        .cmp(&remote.last_modified)
        .then_with(|| local.device_id.cmp(&remote.device_id))
    {
        Ordering::Greater => local,
        _ => remote,
    }
}

fn as_synced(record: &SyncableRecord) -> SyncableRecord {
    let mut record = record.clone();
    record.mark_synced();
    record
}
