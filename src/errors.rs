//! Typed error hierarchy for jobtrail.
//!
//! - `StepError`: what a step body returns; decides retry vs. abort
//! - `ErrorKind`: the serializable classification a caller observes
//! - `AuditError`, `ArtifactError`, `StoreError`: per-subsystem failures

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a terminal run failure, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientIoError,
    PlatformDetectionAmbiguous,
    ExtractionFailure,
    AuditChainIntegrityError,
    ArtifactIntegrityError,
    PersistenceConflict,
    LoginRequired,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientIoError => "transient_io_error",
            Self::PlatformDetectionAmbiguous => "platform_detection_ambiguous",
            Self::ExtractionFailure => "extraction_failure",
            Self::AuditChainIntegrityError => "audit_chain_integrity_error",
            Self::ArtifactIntegrityError => "artifact_integrity_error",
            Self::PersistenceConflict => "persistence_conflict",
            Self::LoginRequired => "login_required",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single attempt of a step body.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("step timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("artifact integrity violation: {0}")]
    ArtifactIntegrity(String),

    #[error("login required for host {host}")]
    LoginRequired { host: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("{0}")]
    Fatal(String),
}

impl StepError {
    /// Whether `RetryPolicy` may attempt the step again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout(_) | Self::PersistenceConflict(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::Timeout(_) => ErrorKind::TransientIoError,
            Self::PersistenceConflict(_) => ErrorKind::PersistenceConflict,
            Self::Extraction(_) => ErrorKind::ExtractionFailure,
            Self::ArtifactIntegrity(_) => ErrorKind::ArtifactIntegrityError,
            Self::LoginRequired { .. } => ErrorKind::LoginRequired,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Fatal(_) => ErrorKind::Internal,
        }
    }
}

/// Errors from audit chain verification and the audit trail file.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit chain broken at event {index}: {reason}")]
    ChainIntegrity { index: usize, reason: String },

    #[error("audit trail {path} is already held by another writer")]
    WriterBusy { path: std::path::PathBuf },

    #[error("failed to write audit trail at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode audit event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl AuditError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ChainIntegrity { .. } => ErrorKind::AuditChainIntegrityError,
            Self::WriterBusy { .. } | Self::Io { .. } => ErrorKind::TransientIoError,
            Self::Encode(_) => ErrorKind::Internal,
        }
    }
}

/// Errors from the artifact ledger.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {path} failed verification: expected sha256 {expected}, found {actual}")]
    Integrity {
        path: std::path::PathBuf,
        expected: String,
        actual: String,
    },

    #[error("artifact {path} already exists; artifacts are never rewritten")]
    AlreadyExists { path: std::path::PathBuf },

    #[error("artifact I/O failed at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<ArtifactError> for StepError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::Integrity { .. } | ArtifactError::AlreadyExists { .. } => {
                StepError::ArtifactIntegrity(err.to_string())
            }
            ArtifactError::Io { .. } => StepError::Transient(err.to_string()),
        }
    }
}

/// Errors from the SQLite persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence conflict: {0}")]
    Conflict(String),

    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("run {run_id} is already terminal ({status})")]
    RunAlreadyTerminal { run_id: String, status: String },

    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("database task panicked: {0}")]
    TaskPanicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Conflict(err.to_string())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => StepError::PersistenceConflict(msg),
            StoreError::Sqlite(_) | StoreError::TaskPanicked(_) => {
                StepError::Transient(err.to_string())
            }
            other => StepError::Fatal(other.to_string()),
        }
    }
}
