//! Backup snapshot model and canonical checksum

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::backup_file::BackupType;
use super::record::{RecordPayload, SyncableRecord};
use crate::error::{Error, IntegrityErrorKind, Result};

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Table name to ordered record payloads.
pub type SnapshotTables = BTreeMap<String, Vec<RecordPayload>>;

const METADATA_BACKUP_TYPE: &str = "backup_type";

/// Point-in-time export of clinic records, the unit of backup and restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub clinic_id: String,
    pub device_id: String,
    /// Creation time, truncated to milliseconds
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    pub tables: SnapshotTables,
    /// SHA-256 over the canonical form (hex)
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Fields covered by the checksum, in serialization order.
#[derive(Serialize)]
struct CanonicalSnapshot<'a> {
    clinic_id: &'a str,
    device_id: &'a str,
    timestamp: String,
    version: u32,
    tables: &'a SnapshotTables,
}

impl BackupSnapshot {
    /// Build a sealed snapshot from records grouped by table.
    pub fn new(
        clinic_id: impl Into<String>,
        device_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        backup_type: BackupType,
        tables: SnapshotTables,
    ) -> Result<Self> {
        let timestamp = truncate_to_millis(timestamp);
        let mut metadata = Map::new();
        metadata.insert(
            METADATA_BACKUP_TYPE.to_string(),
            Value::String(backup_type.as_str().to_string()),
        );

        let mut snapshot = Self {
            clinic_id: clinic_id.into(),
            device_id: device_id.into(),
            timestamp,
            version: SNAPSHOT_VERSION,
            tables,
            checksum: String::new(),
            metadata: Some(metadata),
        };
        snapshot.checksum = snapshot.compute_checksum()?;
        Ok(snapshot)
    }

    /// Hash of the canonical serialization of the identifying fields and tables.
    ///
    /// `serde_json::Map` keeps keys sorted, so record payloads serialize
    /// deterministically.
    pub fn compute_checksum(&self) -> Result<String> {
        let canonical = CanonicalSnapshot {
            clinic_id: &self.clinic_id,
            device_id: &self.device_id,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            version: self.version,
            tables: &self.tables,
        };
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Fail unless the stored checksum matches the content.
    pub fn verify(&self) -> Result<()> {
        if self.version > SNAPSHOT_VERSION {
            return Err(Error::integrity(
                IntegrityErrorKind::VersionMismatch,
                format!(
                    "snapshot version {} is newer than supported version {SNAPSHOT_VERSION}",
                    self.version
                ),
            ));
        }

        let expected = self.compute_checksum()?;
        if expected != self.checksum {
            return Err(Error::integrity(
                IntegrityErrorKind::ChecksumMismatch,
                format!(
                    "snapshot checksum mismatch for clinic '{}' at {}",
                    self.clinic_id, self.timestamp
                ),
            ));
        }
        Ok(())
    }

    /// Backup type recorded in metadata, defaulting to full.
    #[must_use]
    pub fn backup_type(&self) -> BackupType {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get(METADATA_BACKUP_TYPE))
            .and_then(Value::as_str)
            .and_then(|value| value.parse().ok())
            .unwrap_or(BackupType::Full)
    }

    /// Decode the records of one table.
    pub fn records(&self, table: &str) -> Result<Vec<SyncableRecord>> {
        self.tables
            .get(table)
            .map(|payloads| {
                payloads
                    .iter()
                    .map(|payload| SyncableRecord::from_payload(table, payload))
                    .collect()
            })
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// Group records into snapshot tables, keeping every configured table present.
pub fn tables_from_records<'a>(
    table_names: &[String],
    records: impl IntoIterator<Item = &'a SyncableRecord>,
) -> SnapshotTables {
    let mut tables: SnapshotTables = table_names
        .iter()
        .map(|table| (table.clone(), Vec::new()))
        .collect();
    for record in records {
        tables
            .entry(record.table.clone())
            .or_default()
            .push(record.to_payload());
    }
    tables
}

fn truncate_to_millis(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(timestamp.timestamp_millis()).unwrap_or(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_tables() -> SnapshotTables {
        let record = SyncableRecord::new(
            "patients",
            "p-1",
            "device-a",
            json!({"name": "Ada"}).as_object().cloned().unwrap(),
        );
        tables_from_records(&["patients".to_string(), "visits".to_string()], [&record])
    }

    #[test]
    fn new_snapshot_verifies() {
        let snapshot = BackupSnapshot::new(
            "clinic-1",
            "device-a",
            Utc::now(),
            BackupType::Full,
            sample_tables(),
        )
        .unwrap();

        snapshot.verify().unwrap();
        assert_eq!(snapshot.record_count(), 1);
        assert_eq!(snapshot.tables["visits"].len(), 0);
        assert_eq!(snapshot.backup_type(), BackupType::Full);
    }

    #[test]
    fn checksum_survives_json_roundtrip() {
        let snapshot = BackupSnapshot::new(
            "clinic-1",
            "device-a",
            Utc::now(),
            BackupType::Incremental,
            sample_tables(),
        )
        .unwrap();

        let encoded = serde_json::to_vec(&snapshot).unwrap();
        let decoded: BackupSnapshot = serde_json::from_slice(&encoded).unwrap();

        decoded.verify().unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.backup_type(), BackupType::Incremental);
    }

    #[test]
    fn tampered_table_fails_verification() {
        let mut snapshot = BackupSnapshot::new(
            "clinic-1",
            "device-a",
            Utc::now(),
            BackupType::Full,
            sample_tables(),
        )
        .unwrap();
        snapshot.tables.get_mut("patients").unwrap()[0]
            .insert("name".to_string(), json!("Mallory"));

        let error = snapshot.verify().unwrap_err();
        assert!(matches!(
            error,
            Error::DataIntegrity {
                kind: IntegrityErrorKind::ChecksumMismatch,
                ..
            }
        ));
    }

    #[test]
    fn newer_version_is_rejected() {
        let mut snapshot = BackupSnapshot::new(
            "clinic-1",
            "device-a",
            Utc::now(),
            BackupType::Full,
            SnapshotTables::new(),
        )
        .unwrap();
        snapshot.version = SNAPSHOT_VERSION + 1;

        let error = snapshot.verify().unwrap_err();
        assert!(matches!(
            error,
            Error::DataIntegrity {
                kind: IntegrityErrorKind::VersionMismatch,
                ..
            }
        ));
    }
}
