use std::env;
use std::future::Future;
use std::path::PathBuf;

use carebook_core::models::{RecordPayload, SyncConflict, SyncMetadata};
use carebook_core::sync::{SyncOutcome, SyncReport};
use carebook_core::BackupFileMetadata;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::app::Orchestrator;
use crate::error::CliError;

const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: String,
    pub table: String,
    pub record_id: String,
    pub conflict_type: String,
    pub status: String,
    pub resolution: Option<String>,
    pub conflict_time: i64,
    pub conflict_time_iso: String,
    pub local_data: RecordPayload,
    pub remote_data: RecordPayload,
}

#[derive(Debug, Serialize)]
pub struct BackupListItem {
    pub file_id: String,
    pub file_name: String,
    pub backup_type: String,
    pub device_id: String,
    pub timestamp: String,
    pub size: u64,
    pub key_id: Option<String>,
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id.clone(),
        table: conflict.table.clone(),
        record_id: conflict.record_id.clone(),
        conflict_type: conflict.conflict_type.to_string(),
        status: conflict.status.to_string(),
        resolution: conflict.resolution.map(|resolution| resolution.to_string()),
        conflict_time: conflict.conflict_time,
        conflict_time_iso: format_sync_timestamp(conflict.conflict_time),
        local_data: conflict.local_data.clone(),
        remote_data: conflict.remote_data.clone(),
    }
}

pub fn backup_to_item(backup: &BackupFileMetadata) -> BackupListItem {
    BackupListItem {
        file_id: backup.file_id.clone(),
        file_name: backup.file_name.clone(),
        backup_type: backup.backup_type.to_string(),
        device_id: backup.device_id.clone(),
        timestamp: backup.backup_timestamp.to_rfc3339(),
        size: backup.size,
        key_id: backup.key_id().map(str::to_string),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let resolution = conflict
                .resolution
                .map_or_else(String::new, |resolution| format!(" ({resolution})"));
            format!(
                "{}  {}/{}  {}  {}{}  {}",
                conflict.id,
                conflict.table,
                conflict.record_id,
                conflict.conflict_type,
                conflict.status,
                resolution,
                format_sync_timestamp(conflict.conflict_time)
            )
        })
        .collect()
}

pub fn format_backup_lines(backups: &[BackupFileMetadata]) -> Vec<String> {
    backups
        .iter()
        .map(|backup| {
            let device = if backup.device_id.is_empty() {
                "unknown"
            } else {
                backup.device_id.as_str()
            };
            format!(
                "{}  {:<11}  {:>10}  {:<12}  {}",
                format_datetime(backup.backup_timestamp),
                backup.backup_type,
                format_size(backup.size),
                device,
                backup.file_id
            )
        })
        .collect()
}

pub fn format_metadata_line(metadata: &SyncMetadata, now_ms: i64) -> String {
    let last = |timestamp: Option<i64>| {
        timestamp.map_or_else(
            || "never".to_string(),
            |timestamp| format_relative_time(timestamp, now_ms),
        )
    };
    format!(
        "{:<14} {} pending, {} conflicts, last sync {}, last backup {}",
        metadata.table,
        metadata.pending_changes_count,
        metadata.conflict_count,
        last(metadata.last_sync_timestamp),
        last(metadata.last_backup_timestamp)
    )
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |timestamp| timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_datetime(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;

    if bytes < KIB {
        format!("{bytes} B")
    } else if bytes < MIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    }
}

/// Parse `KEY=VALUE`; values that are valid JSON keep their type.
pub fn parse_field(raw: &str) -> Result<(String, Value), CliError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| CliError::InvalidField(raw.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(CliError::InvalidField(raw.to_string()));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn normalize_record_identifier(id: &str) -> Result<String, CliError> {
    let id = id.trim();
    if id.is_empty() {
        Err(CliError::EmptyRecordId)
    } else {
        Ok(id.to_string())
    }
}

/// Print the outcome summary; failures become errors with the outcome message.
pub fn finish_outcome(outcome: SyncOutcome) -> Result<SyncReport, CliError> {
    match outcome {
        SyncOutcome::Success(report) => {
            println!("{}", report.message);
            Ok(report)
        }
        SyncOutcome::Partial(ref report) => {
            println!("{}", outcome.message());
            if !report.conflict_ids.is_empty() {
                println!("Run `carebook sync conflicts` to review.");
            }
            Ok(report.clone())
        }
        SyncOutcome::Failure(_) => Err(CliError::Operation(outcome.message())),
        SyncOutcome::Cancelled(message) => Err(CliError::Cancelled(message)),
    }
}

/// Run an orchestrator operation, cancelling it on Ctrl-C.
pub async fn run_cancellable(
    orchestrator: &Orchestrator,
    operation: impl Future<Output = SyncOutcome>,
) -> SyncOutcome {
    tokio::pin!(operation);
    tokio::select! {
        outcome = &mut operation => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling...");
            orchestrator.cancel().await;
            operation.await
        }
    }
}

pub fn resolve_db_path(
    cli_db_path: Option<PathBuf>,
    profile: Option<&str>,
) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os("CAREBOOK_DB_PATH").map(PathBuf::from))
    {
        return Ok(path);
    }
    let profile = profile
        .map(str::to_string)
        .or_else(|| env::var("CAREBOOK_PROFILE").ok())
        .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
    default_db_path(&profile)
}

pub fn default_db_path(profile: &str) -> Result<PathBuf, CliError> {
    let profile = normalize_profile_name(profile)?;
    let data_dir = dirs::data_dir()
        .ok_or_else(|| CliError::Config("Failed to resolve CLI data directory".to_string()))?;
    Ok(data_dir.join("carebook").join(profile).join("carebook.db"))
}

pub fn normalize_profile_name(profile: &str) -> Result<String, CliError> {
    let profile = profile.trim();
    if profile.is_empty()
        || !profile
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CliError::Config(format!(
            "profile name '{profile}' may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(profile.to_string())
}
