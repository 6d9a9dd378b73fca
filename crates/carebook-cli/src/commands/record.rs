use carebook_core::models::RecordPayload;
use carebook_core::store::RecordStore;
use carebook_core::SyncableRecord;

use crate::app::App;
use crate::commands::common::{format_sync_timestamp, normalize_record_identifier, parse_field};
use crate::error::CliError;

/// Create a record, or merge the given fields into an existing one.
pub async fn run_record_put(
    app: &App,
    table: &str,
    id: &str,
    raw_fields: &[String],
) -> Result<SyncableRecord, CliError> {
    let id = normalize_record_identifier(id)?;
    let store = app.store();

    let mut fields = store
        .get_records(table, std::slice::from_ref(&id))
        .await?
        .remove(&id)
        .filter(|record| !record.is_deleted)
        .map(|record| record.fields)
        .unwrap_or_else(RecordPayload::new);
    for raw in raw_fields {
        let (key, value) = parse_field(raw)?;
        fields.insert(key, value);
    }

    let record = store
        .upsert_record(table, &id, fields, app.device_id())
        .await?;
    println!("Saved {table}/{}", record.id);
    Ok(record)
}

pub async fn run_record_delete(app: &App, table: &str, id: &str) -> Result<(), CliError> {
    let id = normalize_record_identifier(id)?;
    let store = app.store();
    let existing = store
        .get_records(table, std::slice::from_ref(&id))
        .await?
        .remove(&id);
    if !matches!(existing, Some(record) if !record.is_deleted) {
        return Err(CliError::RecordNotFound(format!("{table}/{id}")));
    }

    store.delete_record(table, &id, app.device_id()).await?;
    println!("Deleted {table}/{id}");
    Ok(())
}

pub async fn run_record_list(
    app: &App,
    table: &str,
    pending_only: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let records: Vec<SyncableRecord> = app
        .store()
        .list_records(table)
        .await?
        .into_iter()
        .filter(|record| !pending_only || record.is_pending())
        .collect();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No records in {table}.");
        return Ok(());
    }

    for line in format_record_lines(&records) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_record_lines(records: &[SyncableRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let deleted = if record.is_deleted { " (deleted)" } else { "" };
            format!(
                "{}{deleted}  [{}]  {}  {}",
                record.id,
                record.sync_status,
                format_sync_timestamp(record.last_modified),
                serde_json::Value::Object(record.fields.clone())
            )
        })
        .collect()
}
