//! Blob transports used as the shared backup mailbox.

mod fs;
mod memory;
mod r2;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

pub use fs::FsBlobTransport;
pub use memory::{InjectedFailure, MemoryBlobTransport, TransportOp};
pub use r2::{R2BlobTransport, R2Config};

/// One blob as reported by a transport listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Transport-assigned identifier
    pub id: String,
    /// Blob name as uploaded
    pub name: String,
    /// Size in bytes
    pub size: u64,
    pub created_time: DateTime<Utc>,
    pub modified_time: DateTime<Utc>,
}

/// Named blob storage operations shared across backends.
///
/// Failures are reported as `Network`, `Authentication`, or `Storage`
/// errors so callers can tell them apart from integrity failures.
#[allow(async_fn_in_trait)]
pub trait BlobTransport {
    /// Store a new blob, returning its id
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<String>;

    /// Fetch blob bytes by id
    async fn download(&self, id: &str) -> Result<Vec<u8>>;

    /// Every blob in the configured location
    async fn list(&self) -> Result<Vec<RemoteFile>>;

    /// Remove a blob by id
    async fn delete(&self, id: &str) -> Result<()>;

    /// Replace a blob's content (and possibly name), returning its id
    async fn update(&self, id: &str, name: &str, bytes: &[u8]) -> Result<String>;

    /// Look a blob up by name
    async fn find_by_name(&self, name: &str) -> Result<Option<RemoteFile>> {
        Ok(self.list().await?.into_iter().find(|file| file.name == name))
    }
}

/// Transport picked at runtime from configuration.
#[derive(Debug, Clone)]
pub enum AnyBlobTransport {
    R2(R2BlobTransport),
    Filesystem(FsBlobTransport),
}

impl AnyBlobTransport {
    /// Short backend label for status output.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::R2(_) => "r2",
            Self::Filesystem(_) => "filesystem",
        }
    }
}

impl BlobTransport for AnyBlobTransport {
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<String> {
        match self {
            Self::R2(transport) => transport.upload(name, bytes).await,
            Self::Filesystem(transport) => transport.upload(name, bytes).await,
        }
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        match self {
            Self::R2(transport) => transport.download(id).await,
            Self::Filesystem(transport) => transport.download(id).await,
        }
    }

    async fn list(&self) -> Result<Vec<RemoteFile>> {
        match self {
            Self::R2(transport) => transport.list().await,
            Self::Filesystem(transport) => transport.list().await,
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match self {
            Self::R2(transport) => transport.delete(id).await,
            Self::Filesystem(transport) => transport.delete(id).await,
        }
    }

    async fn update(&self, id: &str, name: &str, bytes: &[u8]) -> Result<String> {
        match self {
            Self::R2(transport) => transport.update(id, name, bytes).await,
            Self::Filesystem(transport) => transport.update(id, name, bytes).await,
        }
    }
}

/// Reject names that would escape the configured location.
pub(crate) fn validate_blob_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains("..")
    {
        return Err(crate::Error::InvalidInput(format!(
            "blob name '{name}' must be a plain file name"
        )));
    }
    Ok(name)
}
