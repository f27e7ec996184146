use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of every error the orchestrator can return.
///
/// Callers decide whether to retry from the kind alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Command is not valid for the workflow's current state. Nothing was logged.
    IllegalTransition,
    /// Plan-token or artifact mismatch, or a WAL record that fails verification.
    IntegrityViolation,
    /// Approval response for an unknown request or a stale plan-token.
    ReplayRejected,
    /// Engine returned `status=failure`, failed to run, or timed out.
    EngineFailure,
    /// Aggregated policy decision was `deny`.
    PolicyDenied,
    /// WAL append or fsync failed. The command did not apply.
    StorageFailure,
    /// Command issued against a `COMPLETED` or `FAILED` workflow.
    TerminalState,
    /// Input could not be canonicalized.
    Encoding,
    /// Unknown workflow.
    NotFound,
    /// Malformed command input.
    InvalidInput,
}

impl ErrorKind {
    /// Whether re-sending the same command is safe.
    ///
    /// Engine failures need a fresh flight-plan or take-off attempt rather
    /// than a resend, so they are not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::StorageFailure | ErrorKind::ReplayRejected)
    }

    /// Whether the error drove the workflow to `FAILED`.
    pub fn fails_workflow(&self) -> bool {
        matches!(
            self,
            ErrorKind::IntegrityViolation | ErrorKind::EngineFailure | ErrorKind::PolicyDenied
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::IllegalTransition => "illegal_transition",
            ErrorKind::IntegrityViolation => "integrity_violation",
            ErrorKind::ReplayRejected => "replay_rejected",
            ErrorKind::EngineFailure => "engine_failure",
            ErrorKind::PolicyDenied => "policy_denied",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::TerminalState => "terminal_state",
            ErrorKind::Encoding => "encoding",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
        };
        f.write_str(s)
    }
}

/// Errors from the hasher/canonicalizer.
#[derive(Error, Debug)]
pub enum HashError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl HashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HashError::Encoding(_) => ErrorKind::Encoding,
            HashError::Serialization(_) => ErrorKind::InvalidInput,
        }
    }
}

impl From<serde_json::Error> for HashError {
    fn from(e: serde_json::Error) -> Self {
        HashError::Serialization(e.to_string())
    }
}
