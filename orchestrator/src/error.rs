//! Error taxonomy for the orchestration engine.

use crate::core::types::{EffectId, EffectStatus, FailureKind, RunFailure, RunId};

/// Result type used throughout the engine.
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// Every schema violation found in one value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{subject} failed schema validation:\n- {}", .violations.join("\n- "))]
pub struct ValidationError {
    /// What was validated (e.g. `output of task 'lint'`).
    pub subject: String,
    pub violations: Vec<String>,
}

/// Errors raised by the engine and surfaced to operators.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A value failed its schema contract.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A task executor returned an error.
    #[error("task '{task}' failed at {effect_id}: {message}")]
    Executor {
        task: String,
        effect_id: EffectId,
        message: String,
    },

    /// The live call sequence diverged from the journal.
    #[error(
        "replay mismatch in run {run_id} at {effect_id}: journal has {expected}, process requested {actual}"
    )]
    ReplayMismatch {
        run_id: RunId,
        effect_id: EffectId,
        expected: String,
        actual: String,
    },

    /// A breakpoint was resolved twice with different resolutions.
    #[error("breakpoint {breakpoint_id} in run {run_id} is already resolved with a different resolution")]
    Conflict {
        run_id: RunId,
        breakpoint_id: EffectId,
    },

    /// Invalid wiring detected before any run starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Write-once guard: the effect already holds a terminal status.
    #[error("effect {effect_id} in run {run_id} is already {status}")]
    AlreadySettled {
        run_id: RunId,
        effect_id: EffectId,
        status: EffectStatus,
    },

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("breakpoint {breakpoint_id} not found in run {run_id}")]
    BreakpointNotFound {
        run_id: RunId,
        breakpoint_id: EffectId,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Raised by process code itself.
    #[error("process failed: {0}")]
    Process(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Storage errors are re-rendered, since `anyhow::Error` cannot be cloned.
impl Clone for OrchestratorError {
    fn clone(&self) -> Self {
        match self {
            OrchestratorError::Validation(err) => OrchestratorError::Validation(err.clone()),
            OrchestratorError::Executor {
                task,
                effect_id,
                message,
            } => OrchestratorError::Executor {
                task: task.clone(),
                effect_id: effect_id.clone(),
                message: message.clone(),
            },
            OrchestratorError::ReplayMismatch {
                run_id,
                effect_id,
                expected,
                actual,
            } => OrchestratorError::ReplayMismatch {
                run_id: run_id.clone(),
                effect_id: effect_id.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            OrchestratorError::Conflict {
                run_id,
                breakpoint_id,
            } => OrchestratorError::Conflict {
                run_id: run_id.clone(),
                breakpoint_id: breakpoint_id.clone(),
            },
            OrchestratorError::Configuration(message) => {
                OrchestratorError::Configuration(message.clone())
            }
            OrchestratorError::AlreadySettled {
                run_id,
                effect_id,
                status,
            } => OrchestratorError::AlreadySettled {
                run_id: run_id.clone(),
                effect_id: effect_id.clone(),
                status: *status,
            },
            OrchestratorError::RunNotFound(run_id) => OrchestratorError::RunNotFound(run_id.clone()),
            OrchestratorError::ProcessNotFound(id) => OrchestratorError::ProcessNotFound(id.clone()),
            OrchestratorError::BreakpointNotFound {
                run_id,
                breakpoint_id,
            } => OrchestratorError::BreakpointNotFound {
                run_id: run_id.clone(),
                breakpoint_id: breakpoint_id.clone(),
            },
            OrchestratorError::InvalidState(message) => {
                OrchestratorError::InvalidState(message.clone())
            }
            OrchestratorError::Process(message) => OrchestratorError::Process(message.clone()),
            OrchestratorError::Storage(err) => {
                OrchestratorError::Storage(anyhow::anyhow!("{err:#}"))
            }
        }
    }
}

impl OrchestratorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            OrchestratorError::Validation(_) => FailureKind::Validation,
            OrchestratorError::Executor { .. } => FailureKind::Executor,
            OrchestratorError::ReplayMismatch { .. } => FailureKind::ReplayMismatch,
            OrchestratorError::Conflict { .. } => FailureKind::Conflict,
            OrchestratorError::Configuration(_) => FailureKind::Configuration,
            OrchestratorError::Process(_) => FailureKind::Process,
            OrchestratorError::Storage(_) => FailureKind::Storage,
            _ => FailureKind::Other,
        }
    }

    /// Errors local to one effect attempt that the retry loop may absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Validation(_) | OrchestratorError::Executor { .. }
        )
    }

    /// Convert into the failure record attached to a failed run.
    pub fn to_run_failure(&self, effect_id: Option<EffectId>) -> RunFailure {
        let effect_id = match self {
            OrchestratorError::Executor { effect_id, .. }
            | OrchestratorError::ReplayMismatch { effect_id, .. } => Some(effect_id.clone()),
            _ => effect_id,
        };
        RunFailure {
            kind: self.kind(),
            effect_id,
            message: format!("{self:#}"),
        }
    }
}
