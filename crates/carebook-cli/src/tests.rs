use std::collections::HashMap;
use std::path::{Path, PathBuf};

use carebook_core::config::SyncSettings;
use carebook_core::crypto::KeyRing;
use carebook_core::models::{ConflictResolution, SyncStatus};
use carebook_core::store::RecordStore;
use carebook_core::sync::{SyncFailure, SyncOutcome};
use carebook_core::ErrorCategory;
use clap::{CommandFactory, Parser};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::{tempdir, TempDir};

use crate::app::App;
use crate::cli::{Cli, Commands, CompletionShell, KeepSide, SyncCommands};
use crate::commands::backup::{run_backup_create, run_backup_list, run_backup_verify};
use crate::commands::common::{
    default_db_path, finish_outcome, format_relative_time, format_size, format_sync_timestamp,
    normalize_profile_name, normalize_record_identifier, parse_field, resolve_db_path,
};
use crate::commands::completions::render_completions;
use crate::commands::keys::format_key_lines;
use crate::commands::record::{run_record_delete, run_record_put};
use crate::commands::restore::run_restore;
use crate::commands::sync::run_sync;
use crate::error::CliError;

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn parses_sync_and_resolve_commands() {
    let cli = Cli::try_parse_from(["carebook", "sync", "--full"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Sync {
            full: true,
            command: None
        }
    ));

    let cli = Cli::try_parse_from(["carebook", "sync", "resolve", "c-1", "--keep", "remote"])
        .unwrap();
    let Commands::Sync {
        command: Some(SyncCommands::Resolve { conflict_id, keep }),
        ..
    } = cli.command
    else {
        panic!("expected sync resolve");
    };
    assert_eq!(conflict_id, "c-1");
    assert_eq!(ConflictResolution::from(keep), ConflictResolution::KeepRemote);
    assert_eq!(
        ConflictResolution::from(KeepSide::Latest),
        ConflictResolution::LastWriteWins
    );
}

#[test]
fn restore_flags_are_parsed() {
    let cli = Cli::try_parse_from([
        "carebook",
        "--profile",
        "tablet",
        "restore",
        "--file-id",
        "abc",
        "--yes",
    ])
    .unwrap();
    assert_eq!(cli.profile.as_deref(), Some("tablet"));
    let Commands::Restore { file_id, yes } = cli.command else {
        panic!("expected restore");
    };
    assert_eq!(file_id.as_deref(), Some("abc"));
    assert!(yes);
}

#[test]
fn parse_field_keeps_json_types() {
    assert_eq!(
        parse_field("age=36").unwrap(),
        ("age".to_string(), json!(36))
    );
    assert_eq!(
        parse_field("name=Ada Lovelace").unwrap(),
        ("name".to_string(), json!("Ada Lovelace"))
    );
    assert_eq!(
        parse_field("insured=true").unwrap(),
        ("insured".to_string(), json!(true))
    );
    assert_eq!(
        parse_field("note=a=b").unwrap(),
        ("note".to_string(), json!("a=b"))
    );
    assert!(matches!(parse_field("novalue"), Err(CliError::InvalidField(_))));
    assert!(matches!(parse_field(" =x"), Err(CliError::InvalidField(_))));
}

#[test]
fn normalize_record_identifier_rejects_empty() {
    assert!(matches!(
        normalize_record_identifier(" \n "),
        Err(CliError::EmptyRecordId)
    ));
    assert_eq!(normalize_record_identifier("  p-1  ").unwrap(), "p-1");
}

#[test]
fn explicit_db_path_wins() {
    let path = resolve_db_path(Some(PathBuf::from("/tmp/explicit.db")), Some("other")).unwrap();
    assert_eq!(path, PathBuf::from("/tmp/explicit.db"));
}

#[test]
fn profiles_get_their_own_database() {
    let Ok(desk) = default_db_path("desk") else {
        return;
    };
    let tablet = default_db_path("tablet").unwrap();
    assert_ne!(desk, tablet);
    assert!(desk.ends_with("carebook/desk/carebook.db"));
    assert!(normalize_profile_name("../escape").is_err());
    assert!(normalize_profile_name("  ").is_err());
}

#[test]
fn format_helpers() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 3 * 60 * 60_000, now), "3h ago");
    assert_eq!(format_relative_time(now - 2 * 24 * 60 * 60_000, now), "2d ago");
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
    assert_eq!(format_size(512), "512 B");
    assert_eq!(format_size(1536), "1.5 KiB");
    assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
}

#[test]
fn completions_mention_binary_name() {
    for shell in [CompletionShell::Bash, CompletionShell::Zsh, CompletionShell::Fish] {
        let script = String::from_utf8(render_completions(shell)).unwrap();
        assert!(script.contains("carebook"), "{shell:?}");
    }
}

#[test]
fn key_lines_mark_the_active_key() {
    let mut ring = KeyRing::generate();
    ring.rotate();
    let lines = format_key_lines(ring.records());
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("retired"));
    assert!(lines[1].ends_with("active"));
}

#[test]
fn failed_outcomes_become_errors() {
    let outcome = SyncOutcome::Failure(SyncFailure {
        message: "Authentication error (invalid_credentials): bad key".to_string(),
        category: ErrorCategory::Authentication,
        kind: "invalid_credentials".to_string(),
        requires_reauthentication: true,
    });
    let Err(CliError::Operation(message)) = finish_outcome(outcome) else {
        panic!("expected an operation error");
    };
    assert!(message.contains("check storage credentials"));

    let cancelled = finish_outcome(SyncOutcome::Cancelled("stopped".to_string()));
    assert!(matches!(cancelled, Err(CliError::Cancelled(_))));
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempdir().unwrap(),
        }
    }

    fn mailbox(&self) -> PathBuf {
        self.dir.path().join("mailbox")
    }

    async fn app(&self, device: &str) -> App {
        self.app_with(device, Some(&self.mailbox())).await
    }

    async fn app_with(&self, device: &str, mailbox: Option<&Path>) -> App {
        let mut vars = HashMap::from([
            ("CAREBOOK_CLINIC_ID", "clinic-42".to_string()),
            ("CAREBOOK_DEVICE_ID", device.to_string()),
            ("CAREBOOK_MASTER_SECRET", "clinic secret".to_string()),
            ("CAREBOOK_AUTO_RETENTION", "false".to_string()),
        ]);
        if let Some(mailbox) = mailbox {
            vars.insert("CAREBOOK_BLOB_DIR", mailbox.display().to_string());
        }
        let settings = SyncSettings::from_lookup(|key| vars.get(key).cloned()).unwrap();
        let db_path = self.dir.path().join(device).join("carebook.db");
        App::with_settings(settings, &db_path).await.unwrap()
    }
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "current_thread")]
async fn record_put_merges_fields() {
    let workspace = Workspace::new();
    let app = workspace.app("desk").await;

    run_record_put(&app, "patients", "p1", &["name=Ada".to_string()])
        .await
        .unwrap();
    let record = run_record_put(&app, "patients", "p1", &["age=36".to_string()])
        .await
        .unwrap();

    assert_eq!(record.fields["name"], json!("Ada"));
    assert_eq!(record.fields["age"], json!(36));
    assert_eq!(record.device_id, "desk");
    assert!(record.is_pending());

    let missing = run_record_delete(&app, "patients", "nobody").await;
    assert!(matches!(missing, Err(CliError::RecordNotFound(_))));
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "current_thread")]
async fn backup_then_restore_round_trip() {
    let workspace = Workspace::new();

    let app = workspace.app("desk").await;
    run_record_put(&app, "patients", "p1", &["name=Ada".to_string()])
        .await
        .unwrap();
    let report = run_backup_create(app).await.unwrap();
    assert!(report.uploaded.is_some());

    let app = workspace.app("desk").await;
    let records = app.store().list_records("patients").await.unwrap();
    assert_eq!(records[0].sync_status, SyncStatus::Synced);
    run_record_delete(&app, "patients", "p1").await.unwrap();

    assert!(matches!(
        run_restore(app, None, false).await,
        Err(CliError::RestoreNotConfirmed)
    ));

    let app = workspace.app("desk").await;
    let report = run_restore(app, None, true).await.unwrap();
    assert!(report.restored.is_some());

    let app = workspace.app("desk").await;
    let records = app.store().list_records("patients").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].is_deleted);
    assert_eq!(records[0].fields["name"], json!("Ada"));

    let corrupted = run_backup_verify(app).await.unwrap();
    assert!(corrupted.is_empty());
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "current_thread")]
async fn second_device_pulls_records() {
    let workspace = Workspace::new();

    let desk = workspace.app("desk").await;
    run_record_put(&desk, "visits", "v1", &["reason=checkup".to_string()])
        .await
        .unwrap();
    run_sync(desk, true).await.unwrap();

    let tablet = workspace.app("tablet").await;
    let report = run_sync(tablet, false).await.unwrap();
    assert_eq!(report.tables["visits"].pulled, 1);
    assert!(report.uploaded.is_none());

    let tablet = workspace.app("tablet").await;
    let visits = tablet.store().list_records("visits").await.unwrap();
    assert_eq!(visits[0].fields["reason"], json!("checkup"));
    assert_eq!(visits[0].device_id, "desk");

    run_backup_list(tablet, true).await.unwrap();
}

#[cfg_attr(windows, ignore = "libsql integration is flaky on windows CI")]
#[tokio::test(flavor = "current_thread")]
async fn backup_commands_require_a_location() {
    let workspace = Workspace::new();
    let app = workspace.app_with("desk", None).await;
    assert!(matches!(
        run_backup_create(app).await,
        Err(CliError::BackupsNotConfigured)
    ));
}

#[test]
fn sync_status_subcommand_parses() {
    let cli = Cli::try_parse_from(["carebook", "sync", "status", "--json"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Sync {
            full: false,
            command: Some(SyncCommands::Status { json: true })
        }
    ));
}
