use cabincrew_types::{ErrorKind, HashError, WorkflowId};
use thiserror::Error;

/// Errors from WAL operations.
#[derive(Error, Debug)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL corruption in workflow {workflow_id}, segment {segment_id} at offset {offset}: {reason}")]
    Corruption {
        workflow_id: WorkflowId,
        segment_id: u64,
        offset: u64,
        reason: String,
    },

    #[error("checksum mismatch in workflow {workflow_id} at sequence {sequence}")]
    ChecksumMismatch {
        workflow_id: WorkflowId,
        sequence: u64,
    },

    #[error("sequence gap in workflow {workflow_id}: expected {expected}, found {found}")]
    SequenceGap {
        workflow_id: WorkflowId,
        expected: u64,
        found: u64,
    },

    #[error("WAL segment {segment_id} not found for workflow {workflow_id}")]
    SegmentNotFound {
        workflow_id: WorkflowId,
        segment_id: u64,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("WAL storage lock poisoned")]
    LockPoisoned,

    #[error("WAL writer unavailable for workflow {0}")]
    WriterUnavailable(WorkflowId),
}

impl WalError {
    /// Whether the log itself is damaged, as opposed to the storage being
    /// temporarily unavailable.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            WalError::Corruption { .. }
                | WalError::ChecksumMismatch { .. }
                | WalError::SequenceGap { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WalError::Corruption { .. }
            | WalError::ChecksumMismatch { .. }
            | WalError::SequenceGap { .. } => ErrorKind::IntegrityViolation,
            WalError::Hash(e) => e.kind(),
            WalError::Io(_)
            | WalError::SegmentNotFound { .. }
            | WalError::Serialization(_)
            | WalError::LockPoisoned
            | WalError::WriterUnavailable(_) => ErrorKind::StorageFailure,
        }
    }
}

impl From<serde_json::Error> for WalError {
    fn from(e: serde_json::Error) -> Self {
        WalError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WalError>;
