use cabincrew_approval::ApprovalError;
use cabincrew_plantoken::PlanTokenError;
use cabincrew_policy::PolicyError;
use cabincrew_types::{ErrorKind, HashError, State, WorkflowId};
use cabincrew_wal::WalError;
use thiserror::Error;

use crate::engine::EngineError;
use crate::machine::TransitionError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors returned by orchestrator commands.
///
/// [`OrchestratorError::kind`] tells the caller whether the workflow moved
/// and whether the command may be resent.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("workflow {0} not found")]
    NotFound(WorkflowId),

    #[error("workflow {0} already exists")]
    AlreadyExists(WorkflowId),

    #[error("{command} is not valid for workflow {workflow_id} in state {state}")]
    IllegalTransition {
        workflow_id: WorkflowId,
        state: State,
        command: &'static str,
    },

    #[error("workflow {workflow_id} is {state}")]
    TerminalState { workflow_id: WorkflowId, state: State },

    #[error("workflow {0} already has an engine call in flight")]
    InFlight(WorkflowId),

    #[error("workflow {workflow_id} is quarantined: {reason}")]
    Quarantined { workflow_id: WorkflowId, reason: String },

    #[error("integrity violation in workflow {workflow_id}: {}", differences.join("; "))]
    IntegrityViolation {
        workflow_id: WorkflowId,
        differences: Vec<String>,
    },

    #[error("engine failed for workflow {workflow_id}: {message}")]
    EngineFailure { workflow_id: WorkflowId, message: String },

    #[error("policy denied workflow {workflow_id}: {}", violations.join("; "))]
    PolicyDenied {
        workflow_id: WorkflowId,
        violations: Vec<String>,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    PlanToken(#[from] PlanTokenError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Hash(#[from] HashError),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::AlreadyExists(_) | OrchestratorError::InvalidInput(_) => {
                ErrorKind::InvalidInput
            }
            OrchestratorError::IllegalTransition { .. } | OrchestratorError::InFlight(_) => {
                ErrorKind::IllegalTransition
            }
            OrchestratorError::TerminalState { .. } => ErrorKind::TerminalState,
            OrchestratorError::Quarantined { .. } | OrchestratorError::IntegrityViolation { .. } => {
                ErrorKind::IntegrityViolation
            }
            OrchestratorError::EngineFailure { .. } | OrchestratorError::Engine(_) => {
                ErrorKind::EngineFailure
            }
            OrchestratorError::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            OrchestratorError::Transition(e) => e.kind(),
            OrchestratorError::Wal(e) => e.kind(),
            OrchestratorError::PlanToken(e) => e.kind(),
            OrchestratorError::Policy(e) => e.kind(),
            OrchestratorError::Approval(e) => e.kind(),
            OrchestratorError::Hash(e) => e.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
