//! Run state machine.
//!
//! A run moves linearly from [`RunState::Init`] to [`RunState::Completed`],
//! one state per [`Step`]. [`RunState::Failed`] is reachable from every
//! non-terminal state.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Canonicalizing,
    SessionAcquired,
    PlatformDetected,
    ContentExpanded,
    ArtifactsCaptured,
    FieldsExtracted,
    Normalized,
    Persisted,
    Completed,
    Failed,
}

impl RunState {
    /// States in their only legal order, excluding `Failed`.
    pub const ORDER: [RunState; 10] = [
        RunState::Init,
        RunState::Canonicalizing,
        RunState::SessionAcquired,
        RunState::PlatformDetected,
        RunState::ContentExpanded,
        RunState::ArtifactsCaptured,
        RunState::FieldsExtracted,
        RunState::Normalized,
        RunState::Persisted,
        RunState::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Canonicalizing => "canonicalizing",
            Self::SessionAcquired => "session_acquired",
            Self::PlatformDetected => "platform_detected",
            Self::ContentExpanded => "content_expanded",
            Self::ArtifactsCaptured => "artifacts_captured",
            Self::FieldsExtracted => "fields_extracted",
            Self::Normalized => "normalized",
            Self::Persisted => "persisted",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The state that follows `self` on the success path.
    pub fn successor(&self) -> Option<RunState> {
        let index = Self::ORDER.iter().position(|s| s == self)?;
        Self::ORDER.get(index + 1).copied()
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate that a run state transition is legal.
pub fn is_valid_transition(from: RunState, to: RunState) -> bool {
    if from.is_terminal() {
        return false;
    }
    to == RunState::Failed || from.successor() == Some(to)
}

/// One orchestration step; each moves the run into its target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Canonicalize,
    Session,
    DetectPlatform,
    Expand,
    Capture,
    Extract,
    Normalize,
    Persist,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::Canonicalize,
        Step::Session,
        Step::DetectPlatform,
        Step::Expand,
        Step::Capture,
        Step::Extract,
        Step::Normalize,
        Step::Persist,
    ];

    /// Name recorded in audit events and used for per-step timeouts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Canonicalize => "canonicalize",
            Self::Session => "session",
            Self::DetectPlatform => "detect_platform",
            Self::Expand => "expand",
            Self::Capture => "capture",
            Self::Extract => "extract",
            Self::Normalize => "normalize",
            Self::Persist => "persist",
        }
    }

    pub fn target_state(&self) -> RunState {
        match self {
            Self::Canonicalize => RunState::Canonicalizing,
            Self::Session => RunState::SessionAcquired,
            Self::DetectPlatform => RunState::PlatformDetected,
            Self::Expand => RunState::ContentExpanded,
            Self::Capture => RunState::ArtifactsCaptured,
            Self::Extract => RunState::FieldsExtracted,
            Self::Normalize => RunState::Normalized,
            Self::Persist => RunState::Persisted,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal run transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunState,
    pub to: RunState,
}

/// Current state of one run plus the path it took.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    state: RunState,
    history: Vec<RunState>,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::Init,
            history: vec![RunState::Init],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn advance(&mut self, to: RunState) -> Result<(), InvalidTransition> {
        if !is_valid_transition(self.state, to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::trace!(from = %self.state, to = %to, "run state transition");
        self.state = to;
        self.history.push(to);
        Ok(())
    }

    /// Move to `Failed` unless the run already ended.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = RunState::Failed;
            self.history.push(RunState::Failed);
        }
    }
}
