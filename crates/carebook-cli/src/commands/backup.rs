use carebook_core::backup::CorruptedBackup;
use carebook_core::sync::SyncReport;

use crate::app::App;
use crate::commands::common::{
    backup_to_item, finish_outcome, format_backup_lines, format_datetime, format_size,
    run_cancellable, BackupListItem,
};
use crate::error::CliError;

pub async fn run_backup_create(app: App) -> Result<SyncReport, CliError> {
    let orchestrator = app.into_orchestrator()?;
    let outcome = run_cancellable(&orchestrator, orchestrator.create_backup()).await;
    finish_outcome(outcome)
}

pub async fn run_backup_list(app: App, as_json: bool) -> Result<(), CliError> {
    let orchestrator = app.into_orchestrator()?;
    let backups = orchestrator.backups().list_backups().await?;

    if as_json {
        let json_items = backups
            .iter()
            .map(backup_to_item)
            .collect::<Vec<BackupListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups yet.");
        return Ok(());
    }

    for line in format_backup_lines(&backups) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_backup_stats(app: App, as_json: bool) -> Result<(), CliError> {
    let orchestrator = app.into_orchestrator()?;
    let stats = orchestrator.backups().get_backup_statistics().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!(
        "{} backups, {}",
        stats.total_backups,
        format_size(stats.total_size)
    );
    if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
        println!(
            "Oldest {}, newest {}",
            format_datetime(oldest),
            format_datetime(newest)
        );
    }
    for (backup_type, count) in &stats.by_type {
        println!("  {backup_type:<12} {count}");
    }
    for (device, count) in &stats.by_device {
        println!("  device {device:<12} {count}");
    }
    Ok(())
}

pub async fn run_backup_prune(app: App) -> Result<Vec<String>, CliError> {
    let orchestrator = app.into_orchestrator()?;
    orchestrator.backups().organize_backup_files().await?;
    let deleted = orchestrator.backups().enforce_retention_policy().await?;
    if deleted.is_empty() {
        println!("Nothing to prune.");
    } else {
        println!("Deleted {} backups", deleted.len());
    }
    Ok(deleted)
}

pub async fn run_backup_verify(app: App) -> Result<Vec<CorruptedBackup>, CliError> {
    let orchestrator = app.into_orchestrator()?;
    let backups = orchestrator.backups();
    backups.organize_backup_files().await?;
    let total = backups.list_backups().await?.len();
    let corrupted = backups.detect_corrupted_backups().await?;

    if corrupted.is_empty() {
        println!("All {total} backups verified.");
    } else {
        for entry in &corrupted {
            println!(
                "{}  {}  {:?}",
                format_datetime(entry.metadata.backup_timestamp),
                entry.metadata.file_id,
                entry.reason
            );
        }
        println!("{} of {total} backups failed verification.", corrupted.len());
    }
    Ok(corrupted)
}
