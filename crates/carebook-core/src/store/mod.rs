//! Local record store abstraction
//!
//! The store owns clinic records, the conflict log, per-table sync metadata,
//! and the persisted key ring. Every mutation recomputes the table's
//! `pending_changes_count` and `conflict_count` atomically with the change.

mod memory;

#[cfg(test)]
pub(crate) mod contract;

use std::collections::HashMap;

use crate::crypto::KeyRing;
use crate::error::{Error, Result};
use crate::models::{
    tables_from_records, ConflictResolution, RecordPayload, SnapshotTables, SyncConflict,
    SyncMetadata, SyncMetadataUpdate, SyncableRecord,
};
use crate::sync::{ConflictDetection, ConflictResolver};

pub use memory::MemoryRecordStore;

/// Default clinic tables
pub const DEFAULT_TABLES: [&str; 4] = ["patients", "visits", "appointments", "payments"];

/// Trait for local record storage (async)
#[allow(async_fn_in_trait)]
pub trait RecordStore {
    /// Tables this store manages
    fn tables(&self) -> &[String];

    /// Create or edit a record; marks it pending with a fresh timestamp
    async fn upsert_record(
        &self,
        table: &str,
        id: &str,
        fields: RecordPayload,
        device_id: &str,
    ) -> Result<SyncableRecord>;

    /// Turn a live record into a pending tombstone
    async fn delete_record(&self, table: &str, id: &str, device_id: &str)
        -> Result<SyncableRecord>;

    /// Every record of a table, tombstones included, ordered by id
    async fn list_records(&self, table: &str) -> Result<Vec<SyncableRecord>>;

    /// Records with the given ids; missing ids are absent from the map
    async fn get_records(
        &self,
        table: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SyncableRecord>>;

    /// Pending records modified after `since` (all pending when `None`)
    async fn get_changed_records(
        &self,
        table: &str,
        since: Option<i64>,
    ) -> Result<Vec<SyncableRecord>>;

    /// Mark records synced, given as `(id, last_modified)` pairs captured at
    /// export time. A record edited since then keeps its pending state.
    /// Returns how many changed state.
    async fn mark_records_synced(&self, table: &str, versions: &[(String, i64)]) -> Result<usize>;

    /// Write remote versions verbatim, recording each as the synced version
    async fn apply_remote_changes(&self, table: &str, records: &[SyncableRecord])
        -> Result<usize>;

    /// Append a pending conflict to the log; earlier ones stay untouched
    async fn store_conflict(&self, conflict: &SyncConflict) -> Result<()>;

    /// Write the chosen record and mark the conflict resolved, atomically
    async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ConflictResolution,
        record: &SyncableRecord,
    ) -> Result<SyncConflict>;

    /// Conflicts, newest first
    async fn list_conflicts(&self, pending_only: bool, limit: usize) -> Result<Vec<SyncConflict>>;

    async fn get_conflict(&self, conflict_id: &str) -> Result<Option<SyncConflict>>;

    /// Replace every managed table with the snapshot contents, marked synced
    async fn import_snapshot(&self, tables: &SnapshotTables) -> Result<usize>;

    async fn get_sync_metadata(&self, table: &str) -> Result<SyncMetadata>;

    async fn update_sync_metadata(
        &self,
        table: &str,
        update: SyncMetadataUpdate,
    ) -> Result<SyncMetadata>;

    async fn load_key_ring(&self) -> Result<Option<KeyRing>>;

    async fn save_key_ring(&self, ring: &KeyRing) -> Result<()>;

    /// Every managed table as snapshot payloads
    async fn export_snapshot(&self) -> Result<SnapshotTables> {
        let mut records = Vec::new();
        for table in self.tables() {
            records.extend(self.list_records(table).await?);
        }
        Ok(tables_from_records(self.tables(), &records))
    }

    /// Compare remote records with their local versions
    async fn detect_conflicts(
        &self,
        table: &str,
        remote_records: &[SyncableRecord],
    ) -> Result<ConflictDetection> {
        let ids: Vec<String> = remote_records
            .iter()
            .map(|record| record.id.clone())
            .collect();
        let local = self.get_records(table, &ids).await?;
        Ok(ConflictResolver::new().detect_conflicts(table, remote_records, &local))
    }
}

/// Normalize a configured table list (trimmed, deduplicated, non-empty).
pub fn normalize_tables<I, S>(tables: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = Vec::new();
    for table in tables {
        let table = table.as_ref().trim();
        if table.is_empty() {
            continue;
        }
        if !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::InvalidInput(format!(
                "table name '{table}' may only contain letters, digits, '_' and '-'"
            )));
        }
        if !normalized.iter().any(|existing| existing == table) {
            normalized.push(table.to_string());
        }
    }

    if normalized.is_empty() {
        return Err(Error::InvalidInput("at least one table is required".into()));
    }
    Ok(normalized)
}

/// Reject operations on tables the store does not manage.
pub(crate) fn ensure_table(tables: &[String], table: &str) -> Result<()> {
    if tables.iter().any(|known| known == table) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "unknown table '{table}' (managed: {})",
            tables.join(", ")
        )))
    }
}
