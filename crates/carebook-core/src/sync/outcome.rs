//! Operation outcomes returned by the orchestrator

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;
use crate::models::BackupFileMetadata;
use crate::Error;

/// Which orchestrator operation produced a report
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    FullSync,
    IncrementalSync,
    Backup,
    Restore,
    ResolveConflict,
    RotateKey,
}

impl SyncOperation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FullSync => "full sync",
            Self::IncrementalSync => "incremental sync",
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::ResolveConflict => "conflict resolution",
            Self::RotateKey => "key rotation",
        }
    }
}

/// Per-table counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReport {
    /// Remote records applied locally
    pub pulled: usize,
    /// Local records included in the uploaded snapshot
    pub pushed: usize,
    pub conflicts: usize,
    /// Local changes kept over remote versions
    pub kept_local: usize,
    /// Remote versions already present or stale
    pub skipped: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub operation: SyncOperation,
    pub tables: BTreeMap<String, TableReport>,
    pub conflict_ids: Vec<String>,
    /// Table name to failure message
    pub failed_tables: BTreeMap<String, String>,
    pub uploaded: Option<BackupFileMetadata>,
    pub restored: Option<BackupFileMetadata>,
    /// Backups tried and rejected before `restored` succeeded
    pub skipped_backups: Vec<String>,
    pub retention_deleted: Vec<String>,
    /// Extra summary lines, e.g. which conflict was resolved
    pub notes: Vec<String>,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    #[must_use]
    pub fn new(operation: SyncOperation) -> Self {
        let now = Utc::now();
        Self {
            operation,
            tables: BTreeMap::new(),
            conflict_ids: Vec::new(),
            failed_tables: BTreeMap::new(),
            uploaded: None,
            restored: None,
            skipped_backups: Vec::new(),
            retention_deleted: Vec::new(),
            notes: Vec::new(),
            message: String::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn table_mut(&mut self, table: &str) -> &mut TableReport {
        self.tables.entry(table.to_string()).or_default()
    }

    #[must_use]
    pub fn total_pulled(&self) -> usize {
        self.tables.values().map(|table| table.pulled).sum()
    }

    #[must_use]
    pub fn total_pushed(&self) -> usize {
        self.tables.values().map(|table| table.pushed).sum()
    }

    #[must_use]
    pub fn total_conflicts(&self) -> usize {
        self.tables.values().map(|table| table.conflicts).sum()
    }

    /// Conflicts or table failures make an otherwise successful run partial.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.conflict_ids.is_empty() || !self.failed_tables.is_empty()
    }

    /// Close the report with a summary line.
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
        let mut message = format!(
            "{} finished: {} pulled, {} pushed, {} conflicts",
            self.operation.as_str(),
            self.total_pulled(),
            self.total_pushed(),
            self.total_conflicts()
        );
        if let Some(uploaded) = &self.uploaded {
            message.push_str(&format!(", uploaded {}", uploaded.file_name));
        }
        if let Some(restored) = &self.restored {
            message.push_str(&format!(", restored {}", restored.file_name));
        }
        if !self.failed_tables.is_empty() {
            let tables: Vec<&str> = self.failed_tables.keys().map(String::as_str).collect();
            message.push_str(&format!(", failed tables: {}", tables.join(", ")));
        }
        for note in &self.notes {
            message.push_str("; ");
            message.push_str(note);
        }
        self.message = message;
    }
}

/// Why an operation failed, without the underlying error value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub message: String,
    pub category: ErrorCategory,
    /// Snake-case error kind, e.g. `timeout`
    pub kind: String,
    pub requires_reauthentication: bool,
}

impl From<&Error> for SyncFailure {
    fn from(error: &Error) -> Self {
        Self {
            message: error.to_string(),
            category: error.category(),
            kind: error.kind_name(),
            requires_reauthentication: error.requires_reauthentication(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SyncOutcome {
    Success(SyncReport),
    /// Completed, but some tables conflicted or failed.
    Partial(SyncReport),
    Failure(SyncFailure),
    Cancelled(String),
}

impl SyncOutcome {
    /// Outcome for a finished report, partial when it carries conflicts or failures.
    #[must_use]
    pub fn from_report(mut report: SyncReport) -> Self {
        report.finish();
        if report.is_partial() {
            Self::Partial(report)
        } else {
            Self::Success(report)
        }
    }

    /// Cancellation becomes `Cancelled`; everything else a `Failure`.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        if error.is_cancelled() {
            Self::Cancelled(error.to_string())
        } else {
            Self::Failure(SyncFailure::from(error))
        }
    }

    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Success(report) => report.message.clone(),
            Self::Partial(report) => format!("{} (partial)", report.message),
            Self::Failure(failure) => {
                if failure.requires_reauthentication {
                    format!("{} (check storage credentials)", failure.message)
                } else {
                    failure.message.clone()
                }
            }
            Self::Cancelled(message) => message.clone(),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    #[must_use]
    pub const fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Success(report) | Self::Partial(report) => Some(report),
            Self::Failure(_) | Self::Cancelled(_) => None,
        }
    }

    #[must_use]
    pub const fn failure(&self) -> Option<&SyncFailure> {
        match self {
            Self::Failure(failure) => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AuthErrorKind, NetworkErrorKind};

    #[test]
    fn conflicts_make_a_report_partial() {
        let mut report = SyncReport::new(SyncOperation::FullSync);
        report.table_mut("patients").pulled = 2;
        assert!(SyncOutcome::from_report(report.clone()).is_success());

        report.table_mut("patients").conflicts = 1;
        report.conflict_ids.push("c-1".to_string());
        let outcome = SyncOutcome::from_report(report);
        assert!(matches!(outcome, SyncOutcome::Partial(_)));
        assert_eq!(
            outcome.message(),
            "full sync finished: 2 pulled, 0 pushed, 1 conflicts (partial)"
        );
    }

    #[test]
    fn failures_carry_kind_and_reauth_flag() {
        let outcome = SyncOutcome::from_error(&Error::authentication(
            AuthErrorKind::InvalidCredentials,
            "bad key",
        ));
        let failure = outcome.failure().unwrap();
        assert!(failure.requires_reauthentication);
        assert_eq!(failure.kind, "invalid_credentials");
        assert_eq!(failure.category, ErrorCategory::Authentication);

        let outcome = SyncOutcome::from_error(&Error::network(NetworkErrorKind::Timeout, "slow"));
        assert!(!outcome.failure().unwrap().requires_reauthentication);
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        let outcome = SyncOutcome::from_error(&Error::cancelled());
        assert!(matches!(outcome, SyncOutcome::Cancelled(_)));
        assert!(outcome.failure().is_none());
    }

    #[test]
    fn notes_follow_the_summary() {
        let mut report = SyncReport::new(SyncOperation::RotateKey);
        report.notes.push("active key is now k2".to_string());
        let outcome = SyncOutcome::from_report(report);
        assert_eq!(
            outcome.message(),
            "key rotation finished: 0 pulled, 0 pushed, 0 conflicts; active key is now k2"
        );
    }
}
