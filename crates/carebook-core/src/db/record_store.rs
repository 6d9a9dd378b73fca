//! libSQL implementation of `RecordStore`

use std::collections::HashMap;
use std::path::Path;

use libsql::{Connection, Row, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Database;
use crate::crypto::KeyRing;
use crate::error::{Error, Result};
use crate::models::{
    validate_business_fields, ConflictResolution, RecordPayload, SnapshotTables, SyncConflict,
    SyncMetadata, SyncMetadataUpdate, SyncableRecord,
};
use crate::store::{ensure_table, normalize_tables, RecordStore};

const RECORD_COLUMNS: &str =
    "table_name, id, fields, last_modified, sync_status, device_id, is_deleted, synced_version";
const CONFLICT_COLUMNS: &str = "id, table_name, record_id, local_data, remote_data, \
     conflict_time, conflict_type, status, resolution, resolved_at";

const SETTING_DEVICE_ID: &str = "device_id";
const SETTING_KEY_RING: &str = "key_ring";

/// Record store backed by a single libSQL connection.
///
/// Writes are serialized behind an async mutex and every multi-statement
/// mutation runs in one transaction together with its metadata refresh.
pub struct LibSqlRecordStore {
    db: Mutex<Database>,
    tables: Vec<String>,
}

impl LibSqlRecordStore {
    pub fn new<I, S>(db: Database, tables: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            db: Mutex::new(db),
            tables: normalize_tables(tables)?,
        })
    }

    /// Open (or create) the database file and wrap it.
    pub async fn open<I, S>(path: impl AsRef<Path>, tables: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let db = Database::open_or_recover(path).await?;
        Self::new(db, tables)
    }

    pub async fn open_in_memory<I, S>(tables: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let db = Database::open_in_memory().await?;
        Self::new(db, tables)
    }

    /// Stable id of this device, generated and persisted on first use.
    pub async fn device_id(&self) -> Result<String> {
        let db = self.db.lock().await;
        let conn = db.connection();
        if let Some(device_id) = get_setting(conn, SETTING_DEVICE_ID).await? {
            return Ok(device_id);
        }

        let device_id = Uuid::now_v7().to_string();
        set_setting(conn, SETTING_DEVICE_ID, &device_id).await?;
        tracing::info!("Generated device id {device_id}");
        Ok(device_id)
    }
}

impl RecordStore for LibSqlRecordStore {
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

        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<SyncableRecord> = async {
            let record = match select_record(conn, table, id).await? {
                Some(mut existing) => {
                    existing.is_deleted = false;
                    existing.update_fields(fields, device_id);
                    existing
                }
                None => SyncableRecord::new(table, id, device_id, fields),
            };
            write_record(conn, &record).await?;
            refresh_metadata(conn, table).await?;
            Ok(record)
        }
        .await;
        finish(conn, result).await
    }

    async fn delete_record(
        &self,
        table: &str,
        id: &str,
        device_id: &str,
    ) -> Result<SyncableRecord> {
        ensure_table(&self.tables, table)?;
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<SyncableRecord> = async {
            let mut record = select_record(conn, table, id)
                .await?
                .filter(|record| !record.is_deleted)
                .ok_or_else(|| Error::NotFound(format!("{table}/{id}")))?;
            record.mark_deleted(device_id);
            write_record(conn, &record).await?;
            refresh_metadata(conn, table).await?;
            Ok(record)
        }
        .await;
        finish(conn, result).await
    }

    async fn list_records(&self, table: &str) -> Result<Vec<SyncableRecord>> {
        ensure_table(&self.tables, table)?;
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE table_name = ? ORDER BY id"),
                [table],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(parse_record(&row)?);
        }
        Ok(records)
    }

    async fn get_records(
        &self,
        table: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SyncableRecord>> {
        ensure_table(&self.tables, table)?;
        let db = self.db.lock().await;
        let conn = db.connection();

        let mut records = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = select_record(conn, table, id).await? {
                records.insert(id.clone(), record);
            }
        }
        Ok(records)
    }

    async fn get_changed_records(
        &self,
        table: &str,
        since: Option<i64>,
    ) -> Result<Vec<SyncableRecord>> {
        ensure_table(&self.tables, table)?;
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE table_name = ? AND sync_status = 'pending' AND last_modified > ?
                     ORDER BY id"
                ),
                libsql::params![table, since.unwrap_or(i64::MIN)],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(parse_record(&row)?);
        }
        Ok(records)
    }

    async fn mark_records_synced(&self, table: &str, versions: &[(String, i64)]) -> Result<usize> {
        ensure_table(&self.tables, table)?;
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<usize> = async {
            let mut changed = 0;
            for (id, last_modified) in versions {
                let rows = conn
                    .execute(
                        "UPDATE records SET sync_status = 'synced', synced_version = last_modified
                         WHERE table_name = ? AND id = ? AND last_modified = ?
                           AND sync_status = 'pending'",
                        libsql::params![table, id.as_str(), *last_modified],
                    )
                    .await?;
                changed += usize::try_from(rows).unwrap_or_default();
            }
            refresh_metadata(conn, table).await?;
            Ok(changed)
        }
        .await;
        finish(conn, result).await
    }

    async fn apply_remote_changes(
        &self,
        table: &str,
        records: &[SyncableRecord],
    ) -> Result<usize> {
        ensure_table(&self.tables, table)?;
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<usize> = async {
            for record in records {
                let mut record = record.clone();
                table.clone_into(&mut record.table);
                record.mark_synced();
                write_record(conn, &record).await?;
            }
            refresh_metadata(conn, table).await?;
            Ok(records.len())
        }
        .await;
        finish(conn, result).await
    }

    async fn store_conflict(&self, conflict: &SyncConflict) -> Result<()> {
        ensure_table(&self.tables, &conflict.table)?;
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<()> = async {
            write_conflict(conn, conflict).await?;
            refresh_metadata(conn, &conflict.table).await?;
            Ok(())
        }
        .await;
        finish(conn, result).await
    }

    async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: ConflictResolution,
        record: &SyncableRecord,
    ) -> Result<SyncConflict> {
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<SyncConflict> = async {
            let mut conflict = select_conflict(conn, conflict_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
            conflict.resolve(resolution)?;

            let mut record = record.clone();
            record.table.clone_from(&conflict.table);
            write_record(conn, &record).await?;
            write_conflict(conn, &conflict).await?;
            refresh_metadata(conn, &conflict.table).await?;
            Ok(conflict)
        }
        .await;
        finish(conn, result).await
    }

    async fn list_conflicts(&self, pending_only: bool, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        let filter = if pending_only {
            "WHERE status = 'pending'"
        } else {
            ""
        };
        let mut rows = db
            .connection()
            .query(
                &format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts {filter}
                     ORDER BY conflict_time DESC, id DESC
                     LIMIT ?"
                ),
                [i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    async fn get_conflict(&self, conflict_id: &str) -> Result<Option<SyncConflict>> {
        let db = self.db.lock().await;
        select_conflict(db.connection(), conflict_id).await
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
            decoded.push((table.as_str(), records));
        }
        for table in tables.keys().filter(|table| !self.tables.contains(table)) {
            tracing::warn!("Skipping unmanaged table '{table}' during import");
        }

        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<usize> = async {
            let mut imported = 0;
            for (table, records) in &decoded {
                conn.execute("DELETE FROM records WHERE table_name = ?", [*table])
                    .await?;
                for record in records {
                    write_record(conn, record).await?;
                }
                refresh_metadata(conn, table).await?;
                imported += records.len();
            }
            Ok(imported)
        }
        .await;
        finish(conn, result).await
    }

    async fn get_sync_metadata(&self, table: &str) -> Result<SyncMetadata> {
        ensure_table(&self.tables, table)?;
        let db = self.db.lock().await;
        let conn = db.connection();
        refresh_metadata(conn, table).await?;
        read_metadata(conn, table).await
    }

    async fn update_sync_metadata(
        &self,
        table: &str,
        update: SyncMetadataUpdate,
    ) -> Result<SyncMetadata> {
        ensure_table(&self.tables, table)?;
        let db = self.db.lock().await;
        let conn = db.connection();
        begin(conn).await?;
        let result: Result<SyncMetadata> = async {
            refresh_metadata(conn, table).await?;
            let mut metadata = read_metadata(conn, table).await?;
            update.apply_to(&mut metadata);
            conn.execute(
                "UPDATE sync_metadata
                 SET last_sync_timestamp = ?, last_backup_timestamp = ?
                 WHERE table_name = ?",
                libsql::params![
                    nullable(metadata.last_sync_timestamp),
                    nullable(metadata.last_backup_timestamp),
                    table
                ],
            )
            .await?;
            Ok(metadata)
        }
        .await;
        finish(conn, result).await
    }

    async fn load_key_ring(&self) -> Result<Option<KeyRing>> {
        let db = self.db.lock().await;
        get_setting(db.connection(), SETTING_KEY_RING)
            .await?
            .map(|json| KeyRing::from_json(&json))
            .transpose()
    }

    async fn save_key_ring(&self, ring: &KeyRing) -> Result<()> {
        let json = ring.to_json()?;
        let db = self.db.lock().await;
        set_setting(db.connection(), SETTING_KEY_RING, &json).await
    }
}

async fn begin(conn: &Connection) -> Result<()> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    Ok(())
}

/// Commit on success, roll back on failure.
async fn finish<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            conn.execute("ROLLBACK", ()).await.ok();
            Err(e)
        }
    }
}

async fn select_record(conn: &Connection, table: &str, id: &str) -> Result<Option<SyncableRecord>> {
    let mut rows = conn
        .query(
            &format!("SELECT {RECORD_COLUMNS} FROM records WHERE table_name = ? AND id = ?"),
            [table, id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(parse_record(&row)?)),
        None => Ok(None),
    }
}

async fn write_record(conn: &Connection, record: &SyncableRecord) -> Result<()> {
    let fields = serde_json::to_string(&record.fields)?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO records ({RECORD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ),
        libsql::params![
            record.table.as_str(),
            record.id.as_str(),
            fields,
            record.last_modified,
            record.sync_status.as_str(),
            record.device_id.as_str(),
            i64::from(record.is_deleted),
            nullable(record.synced_version)
        ],
    )
    .await?;
    Ok(())
}

fn parse_record(row: &Row) -> Result<SyncableRecord> {
    let fields: String = row.get(2)?;
    let status: String = row.get(4)?;
    Ok(SyncableRecord {
        table: row.get(0)?,
        id: row.get(1)?,
        fields: serde_json::from_str(&fields)?,
        last_modified: row.get(3)?,
        sync_status: status.parse()?,
        device_id: row.get(5)?,
        is_deleted: row.get::<i64>(6)? != 0,
        synced_version: optional_i64(row, 7)?,
    })
}

async fn select_conflict(conn: &Connection, conflict_id: &str) -> Result<Option<SyncConflict>> {
    let mut rows = conn
        .query(
            &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?"),
            [conflict_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(parse_conflict(&row)?)),
        None => Ok(None),
    }
}

async fn write_conflict(conn: &Connection, conflict: &SyncConflict) -> Result<()> {
    let resolution = conflict
        .resolution
        .map_or(Value::Null, |resolution| Value::from(resolution.as_str()));
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO sync_conflicts ({CONFLICT_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ),
        libsql::params![
            conflict.id.as_str(),
            conflict.table.as_str(),
            conflict.record_id.as_str(),
            serde_json::to_string(&conflict.local_data)?,
            serde_json::to_string(&conflict.remote_data)?,
            conflict.conflict_time,
            conflict.conflict_type.as_str(),
            if conflict.is_pending() { "pending" } else { "resolved" },
            resolution,
            nullable(conflict.resolved_at)
        ],
    )
    .await?;
    Ok(())
}

fn parse_conflict(row: &Row) -> Result<SyncConflict> {
    let local_data: String = row.get(3)?;
    let remote_data: String = row.get(4)?;
    let conflict_type: String = row.get(6)?;
    let status: String = row.get(7)?;
    let resolution = match row.get_value(8)? {
        Value::Text(text) => Some(text.parse()?),
        _ => None,
    };

    Ok(SyncConflict {
        id: row.get(0)?,
        table: row.get(1)?,
        record_id: row.get(2)?,
        local_data: serde_json::from_str(&local_data)?,
        remote_data: serde_json::from_str(&remote_data)?,
        conflict_time: row.get(5)?,
        conflict_type: conflict_type.parse()?,
        status: status.parse()?,
        resolution,
        resolved_at: optional_i64(row, 9)?,
    })
}

/// Recompute the denormalized counters of `table` from source rows.
async fn refresh_metadata(conn: &Connection, table: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_metadata (table_name, pending_changes_count, conflict_count)
         VALUES (
             ?1,
             (SELECT COUNT(*) FROM records WHERE table_name = ?1 AND sync_status = 'pending'),
             (SELECT COUNT(*) FROM sync_conflicts WHERE table_name = ?1 AND status = 'pending')
         )
         ON CONFLICT(table_name) DO UPDATE SET
             pending_changes_count = excluded.pending_changes_count,
             conflict_count = excluded.conflict_count",
        [table],
    )
    .await?;
    Ok(())
}

async fn read_metadata(conn: &Connection, table: &str) -> Result<SyncMetadata> {
    let mut rows = conn
        .query(
            "SELECT last_sync_timestamp, last_backup_timestamp, pending_changes_count, conflict_count
             FROM sync_metadata WHERE table_name = ?",
            [table],
        )
        .await?;

    let Some(row) = rows.next().await? else {
        return Ok(SyncMetadata::empty(table));
    };
    Ok(SyncMetadata {
        table: table.to_string(),
        last_sync_timestamp: optional_i64(&row, 0)?,
        last_backup_timestamp: optional_i64(&row, 1)?,
        pending_changes_count: u64::try_from(row.get::<i64>(2)?).unwrap_or_default(),
        conflict_count: u64::try_from(row.get::<i64>(3)?).unwrap_or_default(),
    })
}

async fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut rows = conn
        .query("SELECT value FROM settings WHERE key = ?", [key])
        .await?;

    if let Some(row) = rows.next().await? {
        Ok(Some(row.get(0)?))
    } else {
        Ok(None)
    }
}

async fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
        [key, value],
    )
    .await?;
    Ok(())
}

fn optional_i64(row: &Row, index: i32) -> Result<Option<i64>> {
    match row.get_value(index)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected integer or NULL in column {index}, found {other:?}"
        ))),
    }
}

fn nullable(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}
