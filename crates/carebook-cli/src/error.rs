use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] carebook_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("Invalid field '{0}': expected KEY=VALUE")]
    InvalidField(String),
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Restore replaces every local record. Re-run with --yes to confirm.")]
    RestoreNotConfirmed,
    #[error("{0}")]
    Operation(String),
    #[error("{0}")]
    Cancelled(String),
    #[error(
        "Backups are not configured. Set CAREBOOK_BLOB_DIR for a shared folder, or R2_ACCOUNT_ID, R2_BUCKET, R2_ACCESS_KEY_ID and R2_SECRET_ACCESS_KEY for Cloudflare R2. Backups also need CAREBOOK_MASTER_SECRET."
    )]
    BackupsNotConfigured,
}
