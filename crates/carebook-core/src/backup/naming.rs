//! Backup blob naming: `<prefix>_<clinicId>_<timestamp>.<ext>`
//!
//! The timestamp is RFC 3339 UTC with millisecond precision and `:` replaced
//! by `-`, e.g. `clinic_backup_clinic-42_2024-03-01T09-30-00.000Z.enc`.

use chrono::{DateTime, SecondsFormat, Utc};

/// Default blob name prefix
pub const DEFAULT_PREFIX: &str = "clinic_backup";
/// Default blob extension
pub const DEFAULT_EXTENSION: &str = "enc";

/// Components recovered from a backup blob name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBackupName {
    pub clinic_id: String,
    pub timestamp: DateTime<Utc>,
    pub extension: String,
}

#[must_use]
pub fn backup_file_name(prefix: &str, clinic_id: &str, timestamp: DateTime<Utc>, ext: &str) -> String {
    let stamp = timestamp
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "-");
    format!("{prefix}_{clinic_id}_{stamp}.{ext}")
}

/// Parse a name built with the default prefix.
#[must_use]
pub fn parse_backup_file_name(name: &str) -> Option<ParsedBackupName> {
    parse_backup_file_name_with_prefix(DEFAULT_PREFIX, name)
}

/// Parse a name built with `prefix`; `None` if it does not follow the scheme.
#[must_use]
pub fn parse_backup_file_name_with_prefix(prefix: &str, name: &str) -> Option<ParsedBackupName> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
    let (stem, extension) = rest.rsplit_once('.')?;
    // Without an extension the split lands inside the timestamp's millis.
    if !stem.ends_with('Z') || extension.is_empty() {
        return None;
    }

    let (clinic_id, stamp) = stem.rsplit_once('_')?;
    if clinic_id.is_empty() {
        return None;
    }

    let (date, time) = stamp.split_once('T')?;
    let rfc3339 = format!("{date}T{}", time.replace('-', ":"));
    let timestamp = DateTime::parse_from_rfc3339(&rfc3339)
        .ok()?
        .with_timezone(&Utc);

    Some(ParsedBackupName {
        clinic_id: clinic_id.to_string(),
        timestamp,
        extension: extension.to_string(),
    })
}
