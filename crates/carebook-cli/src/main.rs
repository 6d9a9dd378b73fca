//! Carebook CLI - clinic records, encrypted backups, and device sync
//!
//! Reads clinic and backup settings from the environment (or a `.env` file)
//! and runs one command against the local database.

mod app;
mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::cli::{BackupCommands, Cli, Commands, KeysCommands, RecordCommands, SyncCommands};
use crate::commands::backup::{
    run_backup_create, run_backup_list, run_backup_prune, run_backup_stats, run_backup_verify,
};
use crate::commands::common::resolve_db_path;
use crate::commands::completions::run_completions;
use crate::commands::keys::{run_keys_list, run_keys_rotate};
use crate::commands::record::{run_record_delete, run_record_list, run_record_put};
use crate::commands::restore::run_restore;
use crate::commands::sync::{run_sync, run_sync_conflicts, run_sync_resolve, run_sync_status};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("carebook=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let db_path = resolve_db_path(cli.db_path, cli.profile.as_deref())?;
    let app = App::open(&db_path).await?;

    match cli.command {
        Commands::Record { command } => match command {
            RecordCommands::Put { table, id, fields } => {
                run_record_put(&app, &table, &id, &fields).await?;
            }
            RecordCommands::Delete { table, id } => run_record_delete(&app, &table, &id).await?,
            RecordCommands::List {
                table,
                pending,
                json,
            } => run_record_list(&app, &table, pending, json).await?,
        },
        Commands::Sync { full, command } => match command {
            None => {
                run_sync(app, full).await?;
            }
            Some(SyncCommands::Status { json }) => run_sync_status(&app, json).await?,
            Some(SyncCommands::Conflicts { limit, all, json }) => {
                run_sync_conflicts(&app, limit, all, json).await?;
            }
            Some(SyncCommands::Resolve { conflict_id, keep }) => {
                run_sync_resolve(app, &conflict_id, keep.into()).await?;
            }
        },
        Commands::Backup { command } => match command {
            BackupCommands::Create => {
                run_backup_create(app).await?;
            }
            BackupCommands::List { json } => run_backup_list(app, json).await?,
            BackupCommands::Stats { json } => run_backup_stats(app, json).await?,
            BackupCommands::Prune => {
                run_backup_prune(app).await?;
            }
            BackupCommands::Verify => {
                let corrupted = run_backup_verify(app).await?;
                if !corrupted.is_empty() {
                    std::process::exit(2);
                }
            }
        },
        Commands::Restore { file_id, yes } => {
            run_restore(app, file_id.as_deref(), yes).await?;
        }
        Commands::Keys { command } => match command {
            KeysCommands::List => run_keys_list(&app).await?,
            KeysCommands::Rotate => {
                run_keys_rotate(app).await?;
            }
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}
