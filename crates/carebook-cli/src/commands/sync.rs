use carebook_core::models::{ConflictResolution, SyncMetadata};
use carebook_core::store::RecordStore;
use carebook_core::sync::SyncReport;
use chrono::Utc;
use serde::Serialize;

use crate::app::App;
use crate::commands::common::{
    finish_outcome, format_metadata_line, format_sync_conflict_lines, run_cancellable,
    sync_conflict_to_item, SyncConflictItem,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct SyncStatusItem {
    pub clinic_id: String,
    pub device_id: String,
    pub transport: Option<&'static str>,
    pub tables: Vec<SyncMetadata>,
}

pub async fn run_sync(app: App, full: bool) -> Result<SyncReport, CliError> {
    let orchestrator = app.into_orchestrator()?;
    let outcome = if full {
        run_cancellable(&orchestrator, orchestrator.perform_full_sync()).await
    } else {
        run_cancellable(&orchestrator, orchestrator.perform_incremental_sync()).await
    };
    finish_outcome(outcome)
}

pub async fn run_sync_status(app: &App, as_json: bool) -> Result<(), CliError> {
    let store = app.store();
    let mut tables = Vec::new();
    for table in store.tables() {
        tables.push(store.get_sync_metadata(table).await?);
    }

    let transport = app
        .settings()
        .transport
        .as_ref()
        .map(carebook_core::config::TransportSettings::kind);

    if as_json {
        let status = SyncStatusItem {
            clinic_id: app.settings().clinic_id.clone(),
            device_id: app.device_id().to_string(),
            transport,
            tables,
        };
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "Clinic {} on device {} ({})",
        app.settings().clinic_id,
        app.device_id(),
        transport.unwrap_or("no backup location")
    );
    let now_ms = Utc::now().timestamp_millis();
    for metadata in &tables {
        println!("{}", format_metadata_line(metadata, now_ms));
    }
    Ok(())
}

pub async fn run_sync_conflicts(
    app: &App,
    limit: usize,
    include_resolved: bool,
    as_json: bool,
) -> Result<(), CliError> {
    let conflicts = app
        .store()
        .list_conflicts(!include_resolved, limit)
        .await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_resolve(
    app: App,
    conflict_id: &str,
    resolution: ConflictResolution,
) -> Result<SyncReport, CliError> {
    let orchestrator = app.into_orchestrator()?;
    let outcome = orchestrator
        .resolve_conflict(conflict_id.trim(), resolution)
        .await;
    finish_outcome(outcome)
}
