use cabincrew_types::{ApprovalId, ContentHash, ErrorKind};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("no pending approval request {0}")]
    UnknownApproval(ApprovalId),

    #[error("approval {0} was already decided differently")]
    AlreadyDecided(ApprovalId),

    #[error("approval {approval_id} is bound to plan token {bound}, current plan token is {current}")]
    StalePlanToken {
        approval_id: ApprovalId,
        bound: ContentHash,
        current: ContentHash,
    },

    #[error("approval response {0} names no approver")]
    MissingApprover(ApprovalId),

    #[error("approval request needs a non-empty {0}")]
    InvalidRequest(&'static str),
}

impl ApprovalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApprovalError::UnknownApproval(_)
            | ApprovalError::AlreadyDecided(_)
            | ApprovalError::StalePlanToken { .. } => ErrorKind::ReplayRejected,
            ApprovalError::MissingApprover(_) | ApprovalError::InvalidRequest(_) => {
                ErrorKind::InvalidInput
            }
        }
    }
}
