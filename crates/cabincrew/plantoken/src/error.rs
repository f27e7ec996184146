use cabincrew_types::{ErrorKind, HashError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlanTokenError {
    #[error("invalid plan token input: {0}")]
    InvalidInput(String),

    #[error("artifact `{0}` appears more than once in the plan")]
    DuplicateArtifact(String),

    #[error(transparent)]
    Hash(#[from] HashError),
}

impl PlanTokenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlanTokenError::InvalidInput(_) | PlanTokenError::DuplicateArtifact(_) => {
                ErrorKind::InvalidInput
            }
            PlanTokenError::Hash(e) => e.kind(),
        }
    }
}
