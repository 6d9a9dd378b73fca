//! Backup file metadata and retention policy models

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Whether a backup carries every record or only recent changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(Error::InvalidInput(format!("unknown backup type '{other}'"))),
        }
    }
}

/// Manifest entry describing one uploaded backup blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFileMetadata {
    /// Transport-assigned identifier
    pub file_id: String,
    /// Blob name (`<prefix>_<clinic>_<timestamp>.<ext>`)
    pub file_name: String,
    pub clinic_id: String,
    pub device_id: String,
    pub backup_timestamp: DateTime<Utc>,
    pub backup_type: BackupType,
    pub version: u32,
    /// Blob size in bytes
    pub size: u64,
    /// SHA-256 of the blob bytes (hex); empty when unknown
    pub checksum: String,
    #[serde(default)]
    pub additional_data: Map<String, Value>,
}

impl BackupFileMetadata {
    /// Encryption key id recorded at upload time.
    #[must_use]
    pub fn key_id(&self) -> Option<&str> {
        self.additional_data.get("key_id").and_then(Value::as_str)
    }

    #[must_use]
    pub const fn has_checksum(&self) -> bool {
        !self.checksum.is_empty()
    }
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// How many backups survive a retention pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Newest backup of each of this many most recent days
    pub max_daily_backups: usize,
    /// Newest backup of each of this many most recent months
    pub max_monthly_backups: usize,
    /// Newest backup of each of this many most recent years
    pub max_yearly_backups: usize,
    /// Backups older than this are dropped (except a partition's newest)
    #[serde(with = "duration_secs")]
    pub max_age: Duration,
}

impl RetentionPolicy {
    #[must_use]
    pub const fn conservative() -> Self {
        Self {
            max_daily_backups: 90,
            max_monthly_backups: 24,
            max_yearly_backups: 10,
            max_age: Duration::from_secs(DAY.as_secs() * 365 * 10),
        }
    }

    #[must_use]
    pub const fn minimal() -> Self {
        Self {
            max_daily_backups: 7,
            max_monthly_backups: 3,
            max_yearly_backups: 1,
            max_age: Duration::from_secs(DAY.as_secs() * 365),
        }
    }

    /// Resolve a preset by name (`default`, `conservative`, `minimal`).
    pub fn preset(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Ok(Self::default()),
            "conservative" => Ok(Self::conservative()),
            "minimal" => Ok(Self::minimal()),
            other => Err(Error::InvalidInput(format!(
                "unknown retention preset '{other}' (expected default, conservative, or minimal)"
            ))),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_daily_backups: 30,
            max_monthly_backups: 12,
            max_yearly_backups: 5,
            max_age: Duration::from_secs(DAY.as_secs() * 365 * 5),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_differ_only_in_limits() {
        let default = RetentionPolicy::preset("default").unwrap();
        let conservative = RetentionPolicy::preset(" Conservative ").unwrap();
        let minimal = RetentionPolicy::preset("minimal").unwrap();

        assert_eq!(default, RetentionPolicy::default());
        assert!(conservative.max_daily_backups > default.max_daily_backups);
        assert!(minimal.max_age < default.max_age);
        assert!(RetentionPolicy::preset("forever").is_err());
    }

    #[test]
    fn backup_type_parses_case_insensitively() {
        assert_eq!("FULL".parse::<BackupType>().unwrap(), BackupType::Full);
        assert_eq!(
            "incremental".parse::<BackupType>().unwrap(),
            BackupType::Incremental
        );
        assert!("diff".parse::<BackupType>().is_err());
    }

    #[test]
    fn retention_policy_serializes_age_in_seconds() {
        let json = serde_json::to_value(RetentionPolicy::minimal()).unwrap();
        assert_eq!(json["max_age"], serde_json::json!(365 * 24 * 60 * 60));
    }
}
