//! Error types for carebook-core
//!
//! Sync, backup, and restore failures are grouped into tagged families so
//! callers can decide on retry, fallback, or re-authentication without
//! inspecting message text.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using carebook-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Network failures reported by a blob transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    NoConnectivity,
    Timeout,
    ServerError,
    RateLimited,
    DnsFailure,
}

/// Credential problems; never retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    TokenExpired,
    InvalidCredentials,
    PermissionDenied,
}

/// Payload could not be trusted after download, decryption, or decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityErrorKind {
    ChecksumMismatch,
    CorruptedData,
    InvalidFormat,
    VersionMismatch,
    DecryptionFailed,
}

/// Remote or local storage refused the operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageErrorKind {
    InsufficientSpace,
    AccessDenied,
    QuotaExceeded,
    NotFound,
}

/// Conflict bookkeeping failures (detection itself never errors).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictErrorKind {
    Unresolvable,
    MultipleConflicts,
    InvalidResolution,
}

/// Orchestrator lifecycle failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationErrorKind {
    AlreadyInProgress,
    Cancelled,
    InvalidState,
}

macro_rules! kind_display {
    ($($kind:ty),* $(,)?) => {
        $(
            impl fmt::Display for $kind {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    let name = serde_json::to_value(self)
                        .ok()
                        .and_then(|value| value.as_str().map(str::to_owned))
                        .unwrap_or_default();
                    f.write_str(&name)
                }
            }
        )*
    };
}

kind_display!(
    NetworkErrorKind,
    AuthErrorKind,
    IntegrityErrorKind,
    StorageErrorKind,
    ConflictErrorKind,
    OperationErrorKind,
);

/// Coarse error family, used by outcomes and the CLI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Authentication,
    DataIntegrity,
    Storage,
    Conflict,
    Operation,
    Internal,
}

/// Errors that can occur in carebook-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport could not reach the remote store
    #[error("Network error ({kind}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Remote store rejected our credentials
    #[error("Authentication error ({kind}): {message}")]
    Authentication { kind: AuthErrorKind, message: String },

    /// Payload failed verification
    #[error("Data integrity error ({kind}): {message}")]
    DataIntegrity {
        kind: IntegrityErrorKind,
        message: String,
    },

    /// Remote or local storage failure
    #[error("Storage error ({kind}): {message}")]
    Storage {
        kind: StorageErrorKind,
        message: String,
    },

    /// Conflict bookkeeping error
    #[error("Conflict error ({kind}): {message}")]
    Conflict {
        kind: ConflictErrorKind,
        message: String,
    },

    /// Orchestrator lifecycle error
    #[error("Operation error ({kind}): {message}")]
    Operation {
        kind: OperationErrorKind,
        message: String,
    },

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record, conflict, or backup not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }

    pub fn authentication(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self::Authentication {
            kind,
            message: message.into(),
        }
    }

    pub fn integrity(kind: IntegrityErrorKind, message: impl Into<String>) -> Self {
        Self::DataIntegrity {
            kind,
            message: message.into(),
        }
    }

    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self::Storage {
            kind,
            message: message.into(),
        }
    }

    pub fn conflict(kind: ConflictErrorKind, message: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            message: message.into(),
        }
    }

    pub fn operation(kind: OperationErrorKind, message: impl Into<String>) -> Self {
        Self::Operation {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::operation(OperationErrorKind::Cancelled, "operation was cancelled")
    }

    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Network { .. } => ErrorCategory::Network,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::DataIntegrity { .. } => ErrorCategory::DataIntegrity,
            Self::Storage { .. } => ErrorCategory::Storage,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::Operation { .. } => ErrorCategory::Operation,
            Self::Database(_)
            | Self::LibSql(_)
            | Self::Io(_)
            | Self::NotFound(_)
            | Self::InvalidInput(_)
            | Self::Serialization(_) => ErrorCategory::Internal,
        }
    }

    /// Transient transport failures worth another attempt.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub const fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::DataIntegrity { .. })
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Operation {
                kind: OperationErrorKind::Cancelled,
                ..
            }
        )
    }

    /// Error raised by transports, as opposed to decoding or local failures.
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Authentication { .. } | Self::Storage { .. }
        )
    }

    /// Snake-case kind, e.g. `timeout` or `already_in_progress`.
    pub fn kind_name(&self) -> String {
        match self {
            Self::Network { kind, .. } => kind.to_string(),
            Self::Authentication { kind, .. } => kind.to_string(),
            Self::DataIntegrity { kind, .. } => kind.to_string(),
            Self::Storage { kind, .. } => kind.to_string(),
            Self::Conflict { kind, .. } => kind.to_string(),
            Self::Operation { kind, .. } => kind.to_string(),
            Self::Database(_) => "database".to_string(),
            Self::LibSql(_) => "libsql".to_string(),
            Self::Io(_) => "io".to_string(),
            Self::NotFound(_) => "not_found".to_string(),
            Self::InvalidInput(_) => "invalid_input".to_string(),
            Self::Serialization(_) => "serialization".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(Error::network(NetworkErrorKind::Timeout, "slow").is_retryable());
        assert!(Error::network(NetworkErrorKind::RateLimited, "429").is_retryable());
        assert!(!Error::authentication(AuthErrorKind::TokenExpired, "expired").is_retryable());
        assert!(!Error::integrity(IntegrityErrorKind::ChecksumMismatch, "bad").is_retryable());
        assert!(!Error::cancelled().is_retryable());
    }

    #[test]
    fn authentication_errors_request_relink() {
        let error = Error::authentication(AuthErrorKind::PermissionDenied, "403");
        assert!(error.requires_reauthentication());
        assert!(error.is_transport());
        assert_eq!(error.category(), ErrorCategory::Authentication);
    }

    #[test]
    fn display_includes_snake_case_kind() {
        let error = Error::integrity(IntegrityErrorKind::DecryptionFailed, "tag mismatch");
        assert_eq!(
            error.to_string(),
            "Data integrity error (decryption_failed): tag mismatch"
        );
        assert_eq!(error.kind_name(), "decryption_failed");
        assert_eq!(Error::NotFound("x".into()).kind_name(), "not_found");
    }

    #[test]
    fn integrity_errors_are_not_transport_errors() {
        let error = Error::integrity(IntegrityErrorKind::InvalidFormat, "garbage");
        assert!(error.is_integrity());
        assert!(!error.is_transport());
    }
}
