use carebook_core::crypto::KeyRecord;
use carebook_core::store::RecordStore;
use carebook_core::sync::SyncReport;

use crate::app::App;
use crate::commands::common::{finish_outcome, format_datetime};
use crate::error::CliError;

pub async fn run_keys_list(app: &App) -> Result<(), CliError> {
    let Some(ring) = app.store().load_key_ring().await? else {
        println!("No backup keys yet; one is created with the first backup.");
        return Ok(());
    };

    for line in format_key_lines(ring.records()) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_keys_rotate(app: App) -> Result<SyncReport, CliError> {
    let orchestrator = app.into_orchestrator()?;
    finish_outcome(orchestrator.rotate_key().await)
}

pub fn format_key_lines(keys: &[KeyRecord]) -> Vec<String> {
    keys.iter()
        .map(|key| {
            let state = match key.retired_at {
                _ if key.active => "active".to_string(),
                Some(retired_at) => format!("retired {}", format_datetime(retired_at)),
                None => "retired".to_string(),
            };
            format!(
                "{}  created {}  {state}",
                key.key_id,
                format_datetime(key.created_at)
            )
        })
        .collect()
}
