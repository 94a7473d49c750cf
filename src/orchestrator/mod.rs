//! Run orchestration: the per-URL state machine, its step envelope and the
//! results handed back to callers.

pub mod runner;
pub mod state;

use crate::adapters::ExtractorMode;
use crate::errors::{AuditError, ErrorKind, StoreError};
use crate::platform::Platform;
use crate::store::RunStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use thiserror::Error;

pub use runner::{Collaborators, RunOptions, RunOrchestrator};
pub use state::{RunState, RunStateMachine, Step};

/// Structured job record written as `job_record.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub run_id: String,
    pub url: String,
    /// Canonical form of the input URL; the job row is keyed by it.
    pub canonical_url: String,
    /// Canonical URL of the page after navigation, preferring the page's own
    /// `rel=canonical` / `og:url` on the same host.
    pub final_url: String,
    pub platform: Platform,
    pub title: String,
    pub company: String,
    pub location: String,
    pub employment_type: Option<String>,
    pub description_text: String,
    pub detected_fields: Map<String, Value>,
    pub content_hash: String,
    pub extracted_at: String,
}

/// A run that reached `Completed`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub url: String,
    pub canonical_url: String,
    pub final_url: String,
    pub platform: Platform,
    pub extractor_mode: ExtractorMode,
    pub content_hash: String,
    pub artifacts_dir: PathBuf,
    pub job_record_path: PathBuf,
    pub job_id: i64,
    /// False when the content was already known and the run converged on an existing row.
    pub job_inserted: bool,
    pub audit_events: usize,
}

/// A run that ended `Failed`.
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub run_id: String,
    pub status: RunStatus,
    pub url: String,
    pub canonical_url: Option<String>,
    /// Known once the session step navigated.
    pub final_url: Option<String>,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub failed_step: Option<String>,
    pub attempts: u32,
    pub artifacts_dir: PathBuf,
    pub audit_events: usize,
}

/// A run stopped because the host needs an interactive login.
///
/// The run itself is closed as failed; re-invoke with `resume_token` once a
/// session has been imported for `host`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginSuspension {
    pub run_id: String,
    pub status: RunStatus,
    pub url: String,
    pub host: String,
    pub error_kind: ErrorKind,
    pub resume_token: String,
    pub artifacts_dir: PathBuf,
    pub audit_events: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RunOutcome {
    Completed(RunSummary),
    Failed(RunFailure),
    LoginRequired(LoginSuspension),
}

impl RunOutcome {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Completed(s) => &s.run_id,
            Self::Failed(f) => &f.run_id,
            Self::LoginRequired(l) => &l.run_id,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed(_) => RunStatus::Succeeded,
            Self::Failed(_) | Self::LoginRequired(_) => RunStatus::Failed,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(f) => Some(f.error_kind),
            Self::LoginRequired(l) => Some(l.error_kind),
        }
    }

    pub fn artifacts_dir(&self) -> &PathBuf {
        match self {
            Self::Completed(s) => &s.artifacts_dir,
            Self::Failed(f) => &f.artifacts_dir,
            Self::LoginRequired(l) => &l.artifacts_dir,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Failures outside any run's audit trail: the trail itself cannot be opened
/// or the run row cannot be written.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Audit(e) => e.kind(),
            Self::Store(StoreError::Conflict(_)) => ErrorKind::PersistenceConflict,
            Self::Store(_) => ErrorKind::Internal,
        }
    }
}
