use carebook_core::sync::SyncReport;

use crate::app::App;
use crate::commands::common::{finish_outcome, run_cancellable};
use crate::error::CliError;

pub async fn run_restore(
    app: App,
    file_id: Option<&str>,
    confirmed: bool,
) -> Result<SyncReport, CliError> {
    if !confirmed {
        return Err(CliError::RestoreNotConfirmed);
    }

    let orchestrator = app.into_orchestrator()?;
    let outcome = match file_id.map(str::trim) {
        Some(file_id) => {
            run_cancellable(&orchestrator, orchestrator.restore_from_backup(file_id, true)).await
        }
        None => run_cancellable(&orchestrator, orchestrator.restore_latest_backup(true)).await,
    };
    let report = finish_outcome(outcome)?;
    if !report.skipped_backups.is_empty() {
        println!(
            "Skipped {} damaged backups: {}",
            report.skipped_backups.len(),
            report.skipped_backups.join(", ")
        );
    }
    Ok(report)
}
