//! Runtime settings for a clinic device.
//!
//! Everything comes from environment variables so the same binary can run on
//! a front-desk machine, a tablet, or a test harness. Partial configuration
//! is an error that names the missing variables.

use std::env;
use std::path::PathBuf;

use crate::models::RetentionPolicy;
use crate::storage::{AnyBlobTransport, FsBlobTransport, R2BlobTransport, R2Config};
use crate::store::{normalize_tables, DEFAULT_TABLES};
use crate::{Error, Result};

pub const ENV_CLINIC_ID: &str = "CAREBOOK_CLINIC_ID";
pub const ENV_DEVICE_ID: &str = "CAREBOOK_DEVICE_ID";
pub const ENV_MASTER_SECRET: &str = "CAREBOOK_MASTER_SECRET";
pub const ENV_TABLES: &str = "CAREBOOK_TABLES";
pub const ENV_RETENTION: &str = "CAREBOOK_RETENTION";
pub const ENV_BLOB_DIR: &str = "CAREBOOK_BLOB_DIR";
pub const ENV_BLOB_PREFIX: &str = "CAREBOOK_BLOB_PREFIX";
pub const ENV_AUTO_RETENTION: &str = "CAREBOOK_AUTO_RETENTION";

const DEFAULT_BLOB_PREFIX: &str = "carebook/";

/// Where backups are exchanged between devices
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportSettings {
    R2 { config: R2Config, prefix: String },
    Filesystem(PathBuf),
}

impl TransportSettings {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::R2 { .. } => "r2",
            Self::Filesystem(_) => "filesystem",
        }
    }

    pub fn build(&self) -> Result<AnyBlobTransport> {
        match self {
            Self::R2 { config, prefix } => Ok(AnyBlobTransport::R2(R2BlobTransport::new(
                config.clone(),
                prefix,
            ))),
            Self::Filesystem(root) => Ok(AnyBlobTransport::Filesystem(FsBlobTransport::new(
                root.clone(),
            )?)),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub clinic_id: String,
    /// Explicit device id; otherwise the store generates and keeps one
    pub device_id: Option<String>,
    pub master_secret: Option<String>,
    pub tables: Vec<String>,
    pub retention: RetentionPolicy,
    pub auto_retention: bool,
    /// `None` when no backup location is configured
    pub transport: Option<TransportSettings>,
}

impl std::fmt::Debug for SyncSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSettings")
            .field("clinic_id", &self.clinic_id)
            .field("device_id", &self.device_id)
            .field(
                "master_secret",
                &self.master_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("tables", &self.tables)
            .field("retention", &self.retention)
            .field("auto_retention", &self.auto_retention)
            .field("transport", &self.transport)
            .finish()
    }
}

impl SyncSettings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let clinic_id = normalize_text_option(lookup(ENV_CLINIC_ID)).ok_or_else(|| {
            Error::InvalidInput(format!("clinic is not configured. Missing: {ENV_CLINIC_ID}"))
        })?;

        let tables = match normalize_text_option(lookup(ENV_TABLES)) {
            Some(list) => normalize_tables(list.split(','))?,
            None => normalize_tables(DEFAULT_TABLES)?,
        };

        let retention = match normalize_text_option(lookup(ENV_RETENTION)) {
            Some(name) => RetentionPolicy::preset(&name)?,
            None => RetentionPolicy::default(),
        };

        let auto_retention = match normalize_text_option(lookup(ENV_AUTO_RETENTION)) {
            Some(value) => parse_flag(ENV_AUTO_RETENTION, &value)?,
            None => true,
        };

        let r2 = R2Config::from_lookup(&lookup)?;
        let blob_dir = normalize_text_option(lookup(ENV_BLOB_DIR)).map(PathBuf::from);
        let transport = match (r2, blob_dir) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidInput(format!(
                    "both R2 and {ENV_BLOB_DIR} are configured; choose one backup location"
                )));
            }
            (Some(config), None) => Some(TransportSettings::R2 {
                config,
                prefix: normalize_text_option(lookup(ENV_BLOB_PREFIX))
                    .unwrap_or_else(|| DEFAULT_BLOB_PREFIX.to_string()),
            }),
            (None, Some(root)) => Some(TransportSettings::Filesystem(root)),
            (None, None) => None,
        };

        // Without a secret, backup keys follow from the clinic id and the
        // salts stored next to the blobs.
        let master_secret = normalize_text_option(lookup(ENV_MASTER_SECRET));
        if let (Some(transport), None) = (&transport, &master_secret) {
            return Err(Error::InvalidInput(format!(
                "a {} backup location requires {ENV_MASTER_SECRET}",
                transport.kind()
            )));
        }

        Ok(Self {
            clinic_id,
            device_id: normalize_text_option(lookup(ENV_DEVICE_ID)),
            master_secret,
            tables,
            retention,
            auto_retention,
            transport,
        })
    }
}

fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::InvalidInput(format!(
            "{key} must be true or false, got '{other}'"
        ))),
    }
}
