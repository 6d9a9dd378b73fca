use std::path::PathBuf;

use carebook_core::models::ConflictResolution;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "carebook")]
#[command(about = "Clinic records with encrypted backups and multi-device sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Profile name; each profile keeps its own local database
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, edit, delete, and list local records
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Pull remote changes and push local ones
    Sync {
        /// Upload a full snapshot instead of only changed records
        #[arg(long)]
        full: bool,
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Manage backups in the shared mailbox
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Replace local records with a full backup
    Restore {
        /// Backup file id (latest usable backup when omitted)
        #[arg(long, value_name = "ID")]
        file_id: Option<String>,
        /// Confirm that every local record will be replaced
        #[arg(long)]
        yes: bool,
    },
    /// Inspect and rotate backup encryption keys
    Keys {
        #[command(subcommand)]
        command: KeysCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum RecordCommands {
    /// Create or update a record
    Put {
        /// Table name, e.g. patients
        table: String,
        /// Record id
        id: String,
        /// Field to set, as KEY=VALUE (JSON values are parsed)
        #[arg(short, long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },
    /// Delete a record (synced as a tombstone)
    Delete {
        /// Table name
        table: String,
        /// Record id
        id: String,
    },
    /// List records of a table
    List {
        /// Table name
        table: String,
        /// Only records not yet pushed
        #[arg(long)]
        pending: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Show per-table sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve a pending conflict
    Resolve {
        /// Conflict id
        conflict_id: String,
        /// Which version to keep
        #[arg(long, value_enum)]
        keep: KeepSide,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Upload a full backup now
    Create,
    /// List this clinic's backups, newest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Summarize backups by type and device
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete backups the retention policy no longer keeps
    Prune,
    /// Check every backup against its recorded size and checksum
    Verify,
}

#[derive(Subcommand)]
pub enum KeysCommands {
    /// List key generations
    List,
    /// Start a new key generation
    Rotate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepSide {
    Local,
    Remote,
    /// Whichever version was modified last
    Latest,
}

impl From<KeepSide> for ConflictResolution {
    fn from(side: KeepSide) -> Self {
        match side {
            KeepSide::Local => Self::KeepLocal,
            KeepSide::Remote => Self::KeepRemote,
            KeepSide::Latest => Self::LastWriteWins,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
