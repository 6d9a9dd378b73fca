//! In-memory record store for tests and dry runs

use std::collections::{BTreeMap, HashMap};

use tokio::sync::Mutex;

use super::{ensure_table, normalize_tables, RecordStore};
use crate::crypto::KeyRing;
use crate::error::{Error, Result};
use crate::models::{
    validate_business_fields, ConflictResolution, RecordPayload, SnapshotTables, SyncConflict,
    SyncMetadata, SyncMetadataUpdate, SyncableRecord,
};

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<String, BTreeMap<String, SyncableRecord>>,
    conflicts: Vec<SyncConflict>,
    metadata: HashMap<String, SyncMetadata>,
    key_ring: Option<KeyRing>,
}

impl State {
    fn table(&mut self, table: &str) -> &mut BTreeMap<String, SyncableRecord> {
        self.records.entry(table.to_string()).or_default()
    }

    /// Recompute the denormalized counters of `table`.
    fn refresh(&mut self, table: &str) {
        let pending = self
            .records
            .get(table)
            .map_or(0, |records| records.values().filter(|r| r.is_pending()).count());
        let conflicts = self
            .conflicts
            .iter()
            .filter(|conflict| conflict.table == table && conflict.is_pending())
            .count();

        let metadata = self
            .metadata
            .entry(table.to_string())
            .or_insert_with(|| SyncMetadata::empty(table));
        metadata.pending_changes_count = pending as u64;
        metadata.conflict_count = conflicts as u64;
    }
}

/// Record store held entirely in memory
#[derive(Debug)]
pub struct MemoryRecordStore {
    tables: Vec<String>,
    state: Mutex<State>,
}

impl MemoryRecordStore {
    pub fn new<I, S>(tables: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            tables: normalize_tables(tables)?,
            state: Mutex::new(State::default()),
        })
    }
}

impl RecordStore for MemoryRecordStore {
    fn tables(&self) -> &[String] {
        &self.tables
    }

    async fn upsert_record(
        &self,
        table: &str,
        id: &str,
        fields: RecordPayload,
        device_id: &str,
    ) -> Result<SyncableRecord> {
        ensure_table(&self.tables, table)?;
        validate_business_fields(&fields)?;
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("record id cannot be empty".into()));
        }

        let mut state = self.state.lock().await;
        let record = match state.table(table).get_mut(id) {
            Some(existing) => {
                existing.is_deleted = false;
                existing.update_fields(fields, device_id);
                existing.clone()
            }
            None => {
                let record = SyncableRecord::new(table, id, device_id, fields);
                state.table(table).insert(id.to_string(), record.clone());
                record
            }
        };
        state.refresh(table);
        Ok(record)
    }

    async fn delete_record(
        &self,
        table: &str,
        id: &str,
        device_id: &str,
    ) -> Result<SyncableRecord> {
        ensure_table(&self.tables, table)?;
        let mut state = self.state.lock().await;
        let record = match state.table(table).get_mut(id) {
            Some(existing) if !existing.is_deleted => {
                existing.mark_deleted(device_id);
                existing.clone()
            }
            _ => return Err(Error::NotFound(format!("{table}/{id}"))),
        };
        state.refresh(table);
        Ok(record)
    }

    async fn list_records(&self, table: &str) -> Result<Vec<SyncableRecord>> {
        ensure_table(&self.tables, table)?;
        let state = self.state.lock().await;
        Ok(state
            .records
            .get(table)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_records(
        &self,
        table: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SyncableRecord>> {
        ensure_table(&self.tables, table)?;
        let state = self.state.lock().await;
        let Some(records) = state.records.get(table) else {
            return Ok(HashMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|record| (id.clone(), record.clone())))
            .collect())
    }

    async fn get_changed_records(
        &self,
        table: &str,
        since: Option<i64>,
    ) -> Result<Vec<SyncableRecord>> {
        ensure_table(&self.tables, table)?;
        let state = self.state.lock().await;
        Ok(state
            .records
            .get(table)
            .map(|records| {
                records
                    .values()
                    .filter(|record| record.is_pending())
                    .filter(|record| since.is_none_or(|since| record.last_modified > since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_records_synced(&self, table: &str, versions: &[(String, i64)]) -> Result<usize> {
        ensure_table(&self.tables, table)?;
        let mut state = self.state.lock().await;
        let records = state.table(table);
        let mut changed = 0;
        for (id, last_modified) in versions {
            if let Some(record) = records.get_mut(id) {
                if record.is_pending() && record.last_modified == *last_modified {
                    record.mark_synced();
                    changed += 1;
                }
            }
        }
        state.refresh(table);
        Ok(changed)
    }

    async fn apply_remote_changes(
        &self,
        table: &str,
        records: &[SyncableRecord],
    ) -> Result<usize> {
        ensure_table(&self.tables, table)?;
        let mut state = self.state.lock().await;
        let stored = state.table(table);
        for record in records {
            let mut record = record.clone();
            table.clone_into(&mut record.table);
            record.mark_synced();
            stored.insert(record.id.clone(), record);
        }
        state.refresh(table);
        Ok(records.len())
    }

    async fn store_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        ensure_table(&self.tables, &conflict.table)?;
        let mut state = self.state.lock().await;
        state.conflicts.push(conflict.clone());
        state.refresh(&conflict.table);
        Ok(())
    }

    async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ConflictResolution,
        record: &SyncableRecord,
    ) -> Result<SyncConflict> {
        let mut state = self.state.lock().await;
        let conflict = state
            .conflicts
            .iter_mut()
            .find(|conflict| conflict.id == conflict_id)
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        conflict.resolve(resolution)?;
        let resolved = conflict.clone();

        state
            .table(&resolved.table)
            .insert(record.id.clone(), record.clone());
        state.refresh(&resolved.table);
        Ok(resolved)
    }

    async fn list_conflicts(&self, pending_only: bool, limit: usize) -> Result<Vec<SyncConflict>> {
        let state = self.state.lock().await;
        let mut conflicts: Vec<SyncConflict> = state
            .conflicts
            .iter()
            .filter(|conflict| !pending_only || conflict.is_pending())
            .cloned()
            .collect();
        conflicts.sort_by(|a, b| {
            b.conflict_time
                .cmp(&a.conflict_time)
                .then_with(|| b.id.cmp(&a.id))
        });
        conflicts.truncate(limit);
        Ok(conflicts)
    }

    async fn get_conflict(&self, conflict_id: &str) -> Result<Option<SyncConflict>> {
        let state = self.state.lock().await;
        Ok(state
            .conflicts
            .iter()
            .find(|conflict| conflict.id == conflict_id)
            .cloned())
    }

    async fn import_snapshot(&self, tables: &SnapshotTables) -> Result<usize> {
        let mut decoded = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let payloads = tables.get(table).map_or(&[][..], Vec::as_slice);
            let records = payloads
                .iter()
                .map(|payload| {
                    SyncableRecord::from_payload(table, payload).map(|mut record| {
                        record.mark_synced();
                        record
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            decoded.push((table.clone(), records));
        }
        for table in tables.keys().filter(|table| !self.tables.contains(table)) {
            tracing::warn!("Skipping unmanaged table '{table}' during import");
        }

        let mut state = self.state.lock().await;
        let mut imported = 0;
        for (table, records) in decoded {
            imported += records.len();
            let stored = state.table(&table);
            stored.clear();
            stored.extend(records.into_iter().map(|record| (record.id.clone(), record)));
            state.refresh(&table);
        }
        Ok(imported)
    }

    async fn get_sync_metadata(&self, table: &str) -> Result<SyncMetadata> {
        ensure_table(&self.tables, table)?;
        let mut state = self.state.lock().await;
        state.refresh(table);
        Ok(state
            .metadata
            .get(table)
            .cloned()
            .unwrap_or_else(|| SyncMetadata::empty(table)))
    }

    async fn update_sync_metadata(
        &self,
        table: &str,
        update: SyncMetadataUpdate,
    ) -> Result<SyncMetadata> {
        ensure_table(&self.tables, table)?;
        let mut state = self.state.lock().await;
        state.refresh(table);
        let metadata = state
            .metadata
            .entry(table.to_string())
            .or_insert_with(|| SyncMetadata::empty(table));
        update.apply_to(metadata);
        Ok(metadata.clone())
    }

    async fn load_key_ring(&self) -> Result<Option<KeyRing>> {
        Ok(self.state.lock().await.key_ring.clone())
    }

    async fn save_key_ring(&self, ring: &KeyRing) -> Result<()> {
        self.state.lock().await.key_ring = Some(ring.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    fn store() -> MemoryRecordStore {
        MemoryRecordStore::new(["patients", "visits"]).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_count_tracks_mutations() {
        contract::pending_count_tracks_mutations(&store()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mark_synced_is_idempotent() {
        contract::mark_synced_is_idempotent(&store()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn changed_records_respect_marker() {
        contract::changed_records_respect_marker(&store()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edits_after_export_stay_pending() {
        contract::edits_after_export_stay_pending(&store()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_changes_and_conflicts() {
        contract::remote_changes_and_conflicts(&store()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_log_keeps_every_observation() {
        contract::conflict_log_keeps_every_observation(&store()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn import_replaces_tables() {
        contract::import_replaces_tables(&store()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_and_key_ring_persist() {
        contract::metadata_and_key_ring_persist(&store()).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_unknown_tables() {
        contract::rejects_unknown_tables(&store()).await;
    }
}
