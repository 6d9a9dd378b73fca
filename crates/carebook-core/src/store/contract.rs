//! Behaviour every `RecordStore` implementation must share.
//!
//! Each store's test module calls these against a fresh store managing
//! `patients` and `visits`.

use pretty_assertions::assert_eq;
use serde_json::json;

use super::RecordStore;
use crate::crypto::KeyRing;
use crate::models::{
    ConflictResolution, ConflictType, RecordPayload, SnapshotTables, SyncConflict,
    SyncMetadataUpdate, SyncStatus, SyncableRecord,
};

pub fn fields(name: &str) -> RecordPayload {
    let mut fields = RecordPayload::new();
    fields.insert("name".to_string(), json!(name));
    fields
}

fn ids(records: &[SyncableRecord]) -> Vec<String> {
    records.iter().map(|record| record.id.clone()).collect()
}

fn versions(records: &[SyncableRecord]) -> Vec<(String, i64)> {
    records
        .iter()
        .map(|record| (record.id.clone(), record.last_modified))
        .collect()
}

async fn assert_pending_invariant(store: &impl RecordStore, table: &str) {
    let pending = store
        .list_records(table)
        .await
        .unwrap()
        .iter()
        .filter(|record| record.is_pending())
        .count() as u64;
    let metadata = store.get_sync_metadata(table).await.unwrap();
    assert_eq!(metadata.pending_changes_count, pending);
}

pub async fn pending_count_tracks_mutations(store: &impl RecordStore) {
    store
        .upsert_record("patients", "p-1", fields("Ada"), "desk")
        .await
        .unwrap();
    assert_pending_invariant(store, "patients").await;

    store
        .upsert_record("patients", "p-2", fields("Grace"), "desk")
        .await
        .unwrap();
    let edited = store
        .upsert_record("patients", "p-1", fields("Ada L."), "desk")
        .await
        .unwrap();
    assert_eq!(edited.fields, fields("Ada L."));
    assert_pending_invariant(store, "patients").await;

    store
        .mark_records_synced("patients", &versions(&[edited]))
        .await
        .unwrap();
    assert_pending_invariant(store, "patients").await;

    let deleted = store.delete_record("patients", "p-1", "desk").await.unwrap();
    assert!(deleted.is_deleted);
    assert!(deleted.is_pending());
    assert_pending_invariant(store, "patients").await;
    assert_eq!(
        store
            .get_sync_metadata("patients")
            .await
            .unwrap()
            .pending_changes_count,
        2
    );

    assert!(store.delete_record("patients", "p-1", "desk").await.is_err());
    assert!(store.delete_record("patients", "nope", "desk").await.is_err());
}

pub async fn mark_synced_is_idempotent(store: &impl RecordStore) {
    let mut records = Vec::new();
    for id in ["p-1", "p-2", "p-3"] {
        records.push(
            store
                .upsert_record("patients", id, fields(id), "desk")
                .await
                .unwrap(),
        );
    }
    let batch = versions(&records[..2]);

    assert_eq!(store.mark_records_synced("patients", &batch).await.unwrap(), 2);
    let after_first = store.get_sync_metadata("patients").await.unwrap();
    assert_eq!(after_first.pending_changes_count, 1);

    assert_eq!(store.mark_records_synced("patients", &batch).await.unwrap(), 0);
    let after_second = store.get_sync_metadata("patients").await.unwrap();
    assert_eq!(after_second, after_first);
}

pub async fn changed_records_respect_marker(store: &impl RecordStore) {
    let first = store
        .upsert_record("patients", "p-1", fields("Ada"), "desk")
        .await
        .unwrap();
    let second = store
        .upsert_record("patients", "p-2", fields("Grace"), "desk")
        .await
        .unwrap();

    let all = store.get_changed_records("patients", None).await.unwrap();
    assert_eq!(ids(&all), vec!["p-1".to_string(), "p-2".to_string()]);

    let since_first = store
        .get_changed_records("patients", Some(first.last_modified))
        .await
        .unwrap();
    assert!(since_first.iter().all(|r| r.last_modified > first.last_modified));
    assert_eq!(
        since_first.len(),
        usize::from(second.last_modified > first.last_modified)
    );

    store
        .mark_records_synced("patients", &versions(&[second]))
        .await
        .unwrap();
    let remaining = store.get_changed_records("patients", None).await.unwrap();
    assert_eq!(ids(&remaining), vec!["p-1".to_string()]);
}

pub async fn edits_after_export_stay_pending(store: &impl RecordStore) {
    let exported = store
        .upsert_record("patients", "p-1", fields("Ada"), "desk")
        .await
        .unwrap();
    let captured = versions(&[exported]);

    let edited = store
        .upsert_record("patients", "p-1", fields("Ada L."), "desk")
        .await
        .unwrap();
    assert_eq!(store.mark_records_synced("patients", &captured).await.unwrap(), 0);

    let stored = store
        .get_records("patients", &["p-1".to_string()])
        .await
        .unwrap();
    assert!(stored["p-1"].is_pending());
    assert_eq!(stored["p-1"].synced_version, None);
    assert_eq!(
        ids(&store.get_changed_records("patients", None).await.unwrap()),
        vec!["p-1".to_string()]
    );
    assert_pending_invariant(store, "patients").await;

    assert_eq!(
        store
            .mark_records_synced("patients", &versions(&[edited.clone()]))
            .await
            .unwrap(),
        1
    );
    let stored = store
        .get_records("patients", &["p-1".to_string()])
        .await
        .unwrap();
    assert_eq!(stored["p-1"].sync_status, SyncStatus::Synced);
    assert_eq!(stored["p-1"].synced_version, Some(edited.last_modified));
    assert_pending_invariant(store, "patients").await;
}

pub async fn remote_changes_and_conflicts(store: &impl RecordStore) {
    let local = store
        .upsert_record("patients", "p-1", fields("local"), "desk")
        .await
        .unwrap();

    let remote = SyncableRecord {
        table: "patients".to_string(),
        id: "p-1".to_string(),
        last_modified: local.last_modified + 1_000,
        sync_status: SyncStatus::Synced,
        device_id: "tablet".to_string(),
        is_deleted: false,
        fields: fields("remote"),
        synced_version: None,
    };
    let fresh = SyncableRecord {
        id: "p-9".to_string(),
        ..remote.clone()
    };

    let detection = store
        .detect_conflicts("patients", &[remote.clone(), fresh.clone()])
        .await
        .unwrap();
    assert_eq!(detection.conflicts.len(), 1);
    assert_eq!(detection.conflicts[0].conflict_type, ConflictType::Create);
    assert_eq!(ids(&detection.to_apply), vec!["p-1".to_string(), "p-9".to_string()]);

    store
        .apply_remote_changes("patients", &detection.to_apply)
        .await
        .unwrap();
    for conflict in &detection.conflicts {
        store.store_conflict(conflict).await.unwrap();
    }

    let stored = store
        .get_records("patients", &["p-1".to_string(), "p-9".to_string()])
        .await
        .unwrap();
    assert_eq!(stored["p-1"].fields, fields("remote"));
    assert_eq!(stored["p-1"].synced_version, Some(remote.last_modified));
    assert_eq!(stored["p-9"].sync_status, SyncStatus::Synced);

    let metadata = store.get_sync_metadata("patients").await.unwrap();
    assert_eq!(metadata.conflict_count, 1);
    assert_eq!(metadata.pending_changes_count, 0);

    let conflict_id = detection.conflicts[0].id.clone();
    let mut kept = local.clone();
    kept.touch("desk");
    let resolved = store
        .resolve_conflict(&conflict_id, ConflictResolution::KeepLocal, &kept)
        .await
        .unwrap();
    assert!(!resolved.is_pending());
    assert_eq!(resolved.resolution, Some(ConflictResolution::KeepLocal));

    let metadata = store.get_sync_metadata("patients").await.unwrap();
    assert_eq!(metadata.conflict_count, 0);
    assert_eq!(metadata.pending_changes_count, 1);
    assert_pending_invariant(store, "patients").await;

    assert!(store
        .resolve_conflict(&conflict_id, ConflictResolution::KeepRemote, &remote)
        .await
        .is_err());
    assert!(store.get_conflict(&conflict_id).await.unwrap().is_some());
    assert!(store.list_conflicts(true, 10).await.unwrap().is_empty());
    assert_eq!(store.list_conflicts(false, 10).await.unwrap().len(), 1);
}

pub async fn conflict_log_keeps_every_observation(store: &impl RecordStore) {
    let local = store
        .upsert_record("patients", "p-1", fields("desk edit"), "desk")
        .await
        .unwrap();
    let remote = |name: &str, offset: i64| SyncableRecord {
        device_id: "tablet".to_string(),
        last_modified: local.last_modified + offset,
        fields: fields(name),
        ..local.clone()
    };

    let first = SyncConflict::new(
        "patients",
        "p-1",
        local.to_payload(),
        remote("tablet edit", 10).to_payload(),
        ConflictType::Update,
    );
    let second = SyncConflict::new(
        "patients",
        "p-1",
        local.to_payload(),
        remote("tablet second edit", 20).to_payload(),
        ConflictType::Update,
    );
    store.store_conflict(&first).await.unwrap();
    store.store_conflict(&second).await.unwrap();

    assert_eq!(store.get_conflict(&first.id).await.unwrap(), Some(first.clone()));
    assert_eq!(store.get_conflict(&second.id).await.unwrap(), Some(second.clone()));
    assert_eq!(store.list_conflicts(true, 10).await.unwrap().len(), 2);
    assert_eq!(
        store.get_sync_metadata("patients").await.unwrap().conflict_count,
        2
    );

    let mut kept = local.clone();
    kept.touch("desk");
    store
        .resolve_conflict(&second.id, ConflictResolution::KeepLocal, &kept)
        .await
        .unwrap();

    let pending = store.list_conflicts(true, 10).await.unwrap();
    assert_eq!(ids_of(&pending), vec![first.id.clone()]);
    assert_eq!(pending[0].remote_data["name"], json!("tablet edit"));
    assert_eq!(
        store.get_sync_metadata("patients").await.unwrap().conflict_count,
        1
    );
}

fn ids_of(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts.iter().map(|conflict| conflict.id.clone()).collect()
}

pub async fn import_replaces_tables(store: &impl RecordStore) {
    store
        .upsert_record("patients", "stale", fields("old"), "desk")
        .await
        .unwrap();
    store
        .upsert_record("visits", "v-1", fields("checkup"), "desk")
        .await
        .unwrap();

    let imported = SyncableRecord {
        table: "patients".to_string(),
        id: "p-1".to_string(),
        last_modified: 1_700_000_000_000,
        sync_status: SyncStatus::Pending,
        device_id: "tablet".to_string(),
        is_deleted: false,
        fields: fields("Ada"),
        synced_version: None,
    };
    let mut tables = SnapshotTables::new();
    tables.insert("patients".to_string(), vec![imported.to_payload()]);
    tables.insert("unmanaged".to_string(), vec![imported.to_payload()]);

    assert_eq!(store.import_snapshot(&tables).await.unwrap(), 1);

    let patients = store.list_records("patients").await.unwrap();
    assert_eq!(ids(&patients), vec!["p-1".to_string()]);
    assert_eq!(patients[0].sync_status, SyncStatus::Synced);
    assert_eq!(patients[0].synced_version, Some(1_700_000_000_000));
    assert!(store.list_records("visits").await.unwrap().is_empty());
    assert_pending_invariant(store, "patients").await;
    assert_pending_invariant(store, "visits").await;

    let exported = store.export_snapshot().await.unwrap();
    assert_eq!(exported.len(), 2);
    assert_eq!(exported["patients"].len(), 1);
    assert!(exported["visits"].is_empty());
}

pub async fn metadata_and_key_ring_persist(store: &impl RecordStore) {
    let empty = store.get_sync_metadata("visits").await.unwrap();
    assert_eq!(empty.last_sync_timestamp, None);

    store
        .update_sync_metadata("visits", SyncMetadataUpdate::synced_at(42))
        .await
        .unwrap();
    let updated = store
        .update_sync_metadata("visits", SyncMetadataUpdate::default().with_backup_at(99))
        .await
        .unwrap();
    assert_eq!(updated.last_sync_timestamp, Some(42));
    assert_eq!(updated.last_backup_timestamp, Some(99));
    assert_eq!(store.get_sync_metadata("visits").await.unwrap(), updated);

    assert!(store.load_key_ring().await.unwrap().is_none());
    let mut ring = KeyRing::generate();
    ring.rotate();
    store.save_key_ring(&ring).await.unwrap();
    assert_eq!(store.load_key_ring().await.unwrap(), Some(ring));
}

pub async fn rejects_unknown_tables(store: &impl RecordStore) {
    assert!(store
        .upsert_record("invoices", "i-1", fields("x"), "desk")
        .await
        .is_err());
    assert!(store.list_records("invoices").await.is_err());

    let mut reserved = fields("x");
    reserved.insert("sync_status".to_string(), json!("synced"));
    assert!(store
        .upsert_record("patients", "p-1", reserved, "desk")
        .await
        .is_err());
}
