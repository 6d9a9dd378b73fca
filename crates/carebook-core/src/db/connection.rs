//! Database connection management

use crate::error::{Error, Result};
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::path::Path;

use super::migrations;

/// Database wrapper for libSQL connections
pub struct Database {
    // Keeps the database handle alive for the connection's lifetime.
    _db: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;

        let database = Self { _db: db, conn };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Open a database, moving an unreadable file aside and starting fresh once
    ///
    /// Records lost this way are recovered by restoring a backup.
    pub async fn open_or_recover(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match Self::open(path).await {
            Ok(db) => Ok(db),
            Err(error) if is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local database at {} is unreadable: {}. Moving it aside and starting fresh.",
                    path.display(),
                    error
                );
                quarantine_corrupted_db_files(path)?;
                Self::open(path).await
            }
            Err(error) => Err(error),
        }
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        let database = Self { _db: db, conn };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Configure `SQLite` for a single-writer local file
    async fn configure(&self) -> Result<()> {
        // Not every pragma applies to in-memory databases.
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn).await
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn is_corrupted_db_error(error: &Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("file is not a database") || message.contains("database disk image is malformed")
}

fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
    if db_path.exists() {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let file_name = db_path
            .file_name()
            .map_or_else(|| "carebook.db".into(), |name| name.to_string_lossy());
        let backup_path = db_path.with_file_name(format!("{file_name}.corrupt-{timestamp}"));

        std::fs::rename(db_path, &backup_path)?;
        tracing::warn!(
            "Moved corrupted local DB file from {} to {}",
            db_path.display(),
            backup_path.display()
        );
    }

    for suffix in ["-wal", "-shm"] {
        let mut sidecar = db_path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = Path::new(&sidecar);
        if sidecar.exists() {
            std::fs::remove_file(sidecar)?;
        }
    }
    Ok(())
}
