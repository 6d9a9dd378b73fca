//! Local directory transport: a shared folder acting as the blob mailbox.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{validate_blob_name, BlobTransport, RemoteFile};
use crate::error::StorageErrorKind;
use crate::{Error, Result};

/// Blobs stored as files in one directory; the id is the file name.
#[derive(Clone, Debug)]
pub struct FsBlobTransport {
    root: PathBuf,
}

impl FsBlobTransport {
    /// Use `root` as the mailbox, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_blob_name(name)?))
    }

    /// Write through a temp file so readers never see partial blobs.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = self.root.join(format!(".{}.tmp", Uuid::now_v7()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|error| io_error("write", &tmp, error))?;
        if let Err(error) = tokio::fs::rename(&tmp, path).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(io_error("rename", path, error));
        }
        Ok(())
    }
}

impl BlobTransport for FsBlobTransport {
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(name)?;
        self.write_atomic(&path, bytes).await?;
        Ok(validate_blob_name(name)?.to_string())
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(id)?;
        tokio::fs::read(&path)
            .await
            .map_err(|error| io_error("read", &path, error))
    }

    async fn list(&self) -> Result<Vec<RemoteFile>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|error| io_error("list", &self.root, error))?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let modified_time = metadata
                .modified()
                .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);
            let created_time = metadata
                .created()
                .map_or(modified_time, DateTime::<Utc>::from);
            files.push(RemoteFile {
                id: name.clone(),
                name,
                size: metadata.len(),
                created_time,
                modified_time,
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|error| io_error("delete", &path, error))
    }

    async fn update(&self, id: &str, name: &str, bytes: &[u8]) -> Result<String> {
        let old_path = self.path_for(id)?;
        let new_path = self.path_for(name)?;
        self.write_atomic(&new_path, bytes).await?;
        if old_path != new_path {
            match tokio::fs::remove_file(&old_path).await {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(io_error("delete", &old_path, error)),
            }
        }
        Ok(validate_blob_name(name)?.to_string())
    }
}

fn io_error(operation: &str, path: &Path, error: std::io::Error) -> Error {
    let message = format!("{operation} failed for {}: {error}", path.display());
    match error.kind() {
        ErrorKind::NotFound => Error::storage(StorageErrorKind::NotFound, message),
        ErrorKind::PermissionDenied => Error::storage(StorageErrorKind::AccessDenied, message),
        ErrorKind::StorageFull => Error::storage(StorageErrorKind::InsufficientSpace, message),
        _ => Error::Io(error),
    }
}
