//! Syncable clinic record model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, IntegrityErrorKind, Result};

/// Flat field map used on the wire for a single record.
pub type RecordPayload = Map<String, Value>;

const FIELD_ID: &str = "id";
const FIELD_LAST_MODIFIED: &str = "last_modified";
const FIELD_SYNC_STATUS: &str = "sync_status";
const FIELD_DEVICE_ID: &str = "device_id";
const FIELD_IS_DELETED: &str = "is_deleted";

/// Keys owned by the sync layer; business fields may not use them.
pub const RESERVED_FIELDS: [&str; 5] = [
    FIELD_ID,
    FIELD_LAST_MODIFIED,
    FIELD_SYNC_STATUS,
    FIELD_DEVICE_ID,
    FIELD_IS_DELETED,
];

/// Whether a record still has to be pushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            other => Err(Error::InvalidInput(format!("unknown sync status '{other}'"))),
        }
    }
}

/// A record in one of the clinic tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncableRecord {
    /// Table the record lives in (e.g. `patients`)
    pub table: String,
    /// Identifier, unique within the table
    pub id: String,
    /// Last mutation timestamp (Unix ms)
    pub last_modified: i64,
    /// Push state
    pub sync_status: SyncStatus,
    /// Device that made the last mutation
    pub device_id: String,
    /// Soft delete flag for sync
    pub is_deleted: bool,
    /// Business fields
    pub fields: RecordPayload,
    /// `last_modified` of the version this device last pushed or pulled.
    ///
    /// Local only; never part of the wire payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_version: Option<i64>,
}

impl SyncableRecord {
    /// Create a new pending record stamped with the current time
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        id: impl Into<String>,
        device_id: impl Into<String>,
        fields: RecordPayload,
    ) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            last_modified: chrono::Utc::now().timestamp_millis(),
            sync_status: SyncStatus::Pending,
            device_id: device_id.into(),
            is_deleted: false,
            fields,
            synced_version: None,
        }
    }

    /// Record a local mutation: marks pending and refreshes `last_modified`.
    ///
    /// The timestamp never moves backwards, even if the wall clock does.
    pub fn touch(&mut self, device_id: &str) {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_modified = now.max(self.last_modified + 1);
        self.sync_status = SyncStatus::Pending;
        device_id.clone_into(&mut self.device_id);
    }

    /// Replace business fields as a local edit.
    pub fn update_fields(&mut self, fields: RecordPayload, device_id: &str) {
        self.fields = fields;
        self.touch(device_id);
    }

    /// Turn the record into a tombstone as a local edit.
    pub fn mark_deleted(&mut self, device_id: &str) {
        self.is_deleted = true;
        self.touch(device_id);
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.sync_status, SyncStatus::Pending)
    }

    /// Pending and edited since the last synced version.
    #[must_use]
    pub fn has_unsynced_changes(&self) -> bool {
        self.is_pending()
            && self
                .synced_version
                .is_none_or(|version| self.last_modified > version)
    }

    /// Mark this version as the one both sides agree on.
    pub fn mark_synced(&mut self) {
        self.sync_status = SyncStatus::Synced;
        self.synced_version = Some(self.last_modified);
    }

    /// Wire form: business fields plus the reserved sync keys.
    #[must_use]
    pub fn to_payload(&self) -> RecordPayload {
        let mut payload = self.fields.clone();
        payload.insert(FIELD_ID.to_string(), Value::String(self.id.clone()));
        payload.insert(
            FIELD_LAST_MODIFIED.to_string(),
            Value::from(self.last_modified),
        );
        payload.insert(
            FIELD_SYNC_STATUS.to_string(),
            Value::String(self.sync_status.as_str().to_string()),
        );
        payload.insert(
            FIELD_DEVICE_ID.to_string(),
            Value::String(self.device_id.clone()),
        );
        payload.insert(FIELD_IS_DELETED.to_string(), Value::Bool(self.is_deleted));
        payload
    }

    /// Parse a wire payload.
    ///
    /// `id` and `last_modified` are mandatory; a record without a timestamp
    /// cannot take part in conflict detection.
    pub fn from_payload(table: &str, payload: &RecordPayload) -> Result<Self> {
        let id = payload
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| invalid_record(table, "missing string 'id'"))?
            .to_string();

        let last_modified = payload
            .get(FIELD_LAST_MODIFIED)
            .and_then(Value::as_i64)
            .ok_or_else(|| invalid_record(table, &format!("record '{id}' has no last_modified")))?;

        let sync_status = payload
            .get(FIELD_SYNC_STATUS)
            .and_then(Value::as_str)
            .map_or(Ok(SyncStatus::Synced), str::parse)?;

        let device_id = payload
            .get(FIELD_DEVICE_ID)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let is_deleted = payload
            .get(FIELD_IS_DELETED)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let fields = payload
            .iter()
            .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            table: table.to_string(),
            id,
            last_modified,
            sync_status,
            device_id,
            is_deleted,
            fields,
            synced_version: None,
        })
    }
}

fn invalid_record(table: &str, detail: &str) -> Error {
    Error::integrity(
        IntegrityErrorKind::InvalidFormat,
        format!("invalid record in table '{table}': {detail}"),
    )
}

/// Reject business fields that collide with sync keys.
pub fn validate_business_fields(fields: &RecordPayload) -> Result<()> {
    if let Some(key) = fields
        .keys()
        .find(|key| RESERVED_FIELDS.contains(&key.as_str()))
    {
        return Err(Error::InvalidInput(format!(
            "field '{key}' is reserved for sync metadata"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fields() -> RecordPayload {
        json!({"name": "Ada", "age": 36})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn new_record_is_pending() {
        let record = SyncableRecord::new("patients", "p-1", "device-a", fields());
        assert!(record.is_pending());
        assert!(record.last_modified > 0);
        assert!(!record.is_deleted);
    }

    #[test]
    fn touch_marks_pending_and_never_goes_backwards() {
        let mut record = SyncableRecord::new("patients", "p-1", "device-a", fields());
        record.sync_status = SyncStatus::Synced;
        record.last_modified = i64::MAX / 2;

        record.touch("device-b");

        assert!(record.is_pending());
        assert_eq!(record.last_modified, i64::MAX / 2 + 1);
        assert_eq!(record.device_id, "device-b");
    }

    #[test]
    fn payload_roundtrip_keeps_fields_and_metadata() {
        let mut record = SyncableRecord::new("visits", "v-9", "device-a", fields());
        record.sync_status = SyncStatus::Synced;

        let payload = record.to_payload();
        assert_eq!(payload.get("id"), Some(&json!("v-9")));

        let parsed = SyncableRecord::from_payload("visits", &payload).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn synced_version_tracks_local_edits() {
        let mut record = SyncableRecord::new("patients", "p-1", "device-a", fields());
        assert!(record.has_unsynced_changes());

        record.mark_synced();
        assert_eq!(record.synced_version, Some(record.last_modified));
        assert!(!record.has_unsynced_changes());

        record.touch("device-a");
        assert!(record.has_unsynced_changes());
        assert!(record.last_modified > record.synced_version.unwrap());
        assert!(!record.to_payload().contains_key("synced_version"));
    }

    #[test]
    fn payload_without_timestamp_is_rejected() {
        let payload = json!({"id": "p-1", "name": "Ada", "last_modified": null})
            .as_object()
            .cloned()
            .unwrap();

        let error = SyncableRecord::from_payload("patients", &payload).unwrap_err();
        assert!(matches!(
            error,
            Error::DataIntegrity {
                kind: IntegrityErrorKind::InvalidFormat,
                ..
            }
        ));
    }

    #[test]
    fn reserved_business_fields_are_rejected() {
        let payload = json!({"sync_status": "synced"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(validate_business_fields(&payload).is_err());
        assert!(validate_business_fields(&fields()).is_ok());
    }
}
