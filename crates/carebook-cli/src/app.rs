//! Composition root: wires settings, the local store, the transport, and the
//! orchestrator together. Nothing else in the CLI constructs core components.

use std::path::Path;

use carebook_core::backup::BackupFileManager;
use carebook_core::compression::CompressionEngine;
use carebook_core::config::SyncSettings;
use carebook_core::crypto::CryptoEngine;
use carebook_core::db::LibSqlRecordStore;
use carebook_core::storage::AnyBlobTransport;
use carebook_core::sync::{OrchestratorConfig, SyncEvent, SyncOrchestrator};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

use crate::error::CliError;

pub type Orchestrator = SyncOrchestrator<LibSqlRecordStore, AnyBlobTransport>;

pub struct App {
    settings: SyncSettings,
    store: LibSqlRecordStore,
    device_id: String,
}

impl App {
    /// Load settings from the environment and open the local database.
    pub async fn open(db_path: &Path) -> Result<Self, CliError> {
        let settings = SyncSettings::from_env()?;
        Self::with_settings(settings, db_path).await
    }

    pub async fn with_settings(settings: SyncSettings, db_path: &Path) -> Result<Self, CliError> {
        let store = LibSqlRecordStore::open(db_path, &settings.tables).await?;
        let device_id = match &settings.device_id {
            Some(device_id) => device_id.clone(),
            None => store.device_id().await?,
        };
        debug!(
            "Opened {} for clinic {} as device {device_id}",
            db_path.display(),
            settings.clinic_id
        );
        Ok(Self {
            settings,
            store,
            device_id,
        })
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub const fn store(&self) -> &LibSqlRecordStore {
        &self.store
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Build the orchestrator; fails when no backup location is configured.
    pub fn into_orchestrator(self) -> Result<Orchestrator, CliError> {
        let transport = self
            .settings
            .transport
            .as_ref()
            .ok_or(CliError::BackupsNotConfigured)?
            .build()?;
        info!("Using {} backup transport", transport.kind());

        let crypto = match &self.settings.master_secret {
            Some(secret) => CryptoEngine::with_master_secret(secret),
            None => CryptoEngine::new(),
        };
        let backups = BackupFileManager::new(
            transport,
            self.settings.clinic_id.clone(),
            self.settings.retention,
        );
        let config = OrchestratorConfig::new(self.settings.clinic_id.clone(), self.device_id)
            .with_auto_retention(self.settings.auto_retention);

        let orchestrator = SyncOrchestrator::new(
            self.store,
            backups,
            crypto,
            CompressionEngine::default(),
            config,
        );
        tokio::spawn(log_progress(orchestrator.subscribe()));
        Ok(orchestrator)
    }
}

async fn log_progress(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::Progress {
                state,
                phase,
                detail,
            }) => info!("[{state}] {phase}: {detail}"),
            Ok(SyncEvent::StateChanged { from, to }) => debug!("state {from} -> {to}"),
            Err(RecvError::Lagged(skipped)) => debug!("skipped {skipped} progress events"),
            Err(RecvError::Closed) => break,
        }
    }
}
