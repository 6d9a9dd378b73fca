//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::RecordPayload;
use crate::error::{ConflictErrorKind, Error, Result};

/// How the two sides diverged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides edited an existing record
    Update,
    /// One side deleted while the other edited
    Delete,
    /// Both sides created the same id independently
    Create,
}

/// Lifecycle of a recorded conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Pending,
    Resolved,
}

/// Explicit resolution chosen by the user or the default strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepLocal,
    KeepRemote,
    LastWriteWins,
}

macro_rules! str_enum {
    ($ty:ty { $($variant:ident => $name:literal),* $(,)? }) => {
        impl $ty {
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(Self::$variant),)*
                    other => Err(Error::InvalidInput(format!(
                        "unknown {} '{other}'",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

str_enum!(ConflictType {
    Update => "update",
    Delete => "delete",
    Create => "create",
});

str_enum!(ResolutionStatus {
    Pending => "pending",
    Resolved => "resolved",
});

str_enum!(ConflictResolution {
    KeepLocal => "keep_local",
    KeepRemote => "keep_remote",
    LastWriteWins => "last_write_wins",
});

/// Both versions of a record that changed independently on two devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict identifier (UUID v7)
    pub id: String,
    pub table: String,
    pub record_id: String,
    /// Local version at detection time
    pub local_data: RecordPayload,
    /// Incoming remote version
    pub remote_data: RecordPayload,
    /// Detection timestamp (Unix ms)
    pub conflict_time: i64,
    pub conflict_type: ConflictType,
    pub status: ResolutionStatus,
    /// Resolution applied, once resolved
    pub resolution: Option<ConflictResolution>,
    /// Resolution timestamp (Unix ms)
    pub resolved_at: Option<i64>,
}

impl SyncConflict {
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        record_id: impl Into<String>,
        local_data: RecordPayload,
        remote_data: RecordPayload,
        conflict_type: ConflictType,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            table: table.into(),
            record_id: record_id.into(),
            local_data,
            remote_data,
            conflict_time: chrono::Utc::now().timestamp_millis(),
            conflict_type,
            status: ResolutionStatus::Pending,
            resolution: None,
            resolved_at: None,
        }
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.status, ResolutionStatus::Pending)
    }

    /// Mark resolved; a conflict can only be resolved once.
    pub fn resolve(&mut self, resolution: ConflictResolution) -> Result<()> {
        if !self.is_pending() {
            return Err(Error::conflict(
                ConflictErrorKind::InvalidResolution,
                format!("conflict {} is already resolved", self.id),
            ));
        }
        self.status = ResolutionStatus::Resolved;
        self.resolution = Some(resolution);
        self.resolved_at = Some(chrono::Utc::now().timestamp_millis());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_one_shot() {
        let mut conflict = SyncConflict::new(
            "patients",
            "p-1",
            RecordPayload::new(),
            RecordPayload::new(),
            ConflictType::Update,
        );
        assert!(conflict.is_pending());

        conflict.resolve(ConflictResolution::KeepLocal).unwrap();
        assert_eq!(conflict.status, ResolutionStatus::Resolved);
        assert!(conflict.resolved_at.is_some());

        let error = conflict
            .resolve(ConflictResolution::KeepRemote)
            .unwrap_err();
        assert!(matches!(
            error,
            Error::Conflict {
                kind: ConflictErrorKind::InvalidResolution,
                ..
            }
        ));
    }

    #[test]
    fn enum_names_roundtrip() {
        for value in [ConflictType::Update, ConflictType::Delete, ConflictType::Create] {
            assert_eq!(value.as_str().parse::<ConflictType>().unwrap(), value);
        }
        assert_eq!(
            "last_write_wins".parse::<ConflictResolution>().unwrap(),
            ConflictResolution::LastWriteWins
        );
        assert!("merge".parse::<ConflictResolution>().is_err());
    }
}
