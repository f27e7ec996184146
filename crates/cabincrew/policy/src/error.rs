//! Error types for policy evaluation and aggregation

use cabincrew_types::ErrorKind;
use thiserror::Error;

/// Result type for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors that can occur during policy evaluation
#[derive(Debug, Error)]
pub enum PolicyError {
    /// `custom` aggregation selected with no strategy registered
    #[error("custom aggregation selected but no strategy is registered")]
    CustomStrategyMissing,

    /// Evaluation severity outside 0..=3
    #[error("policy `{policy_id}` reported malformed severity {severity}")]
    MalformedSeverity { policy_id: String, severity: u8 },

    /// Custom strategy failed or returned an unusable decision
    #[error("custom aggregation strategy `{strategy}` failed: {message}")]
    Strategy { strategy: String, message: String },

    /// An evaluator could not produce a decision
    #[error("policy evaluator `{policy_id}` failed: {message}")]
    Evaluator { policy_id: String, message: String },
}

impl PolicyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PolicyError::CustomStrategyMissing
            | PolicyError::MalformedSeverity { .. }
            | PolicyError::Strategy { .. } => ErrorKind::InvalidInput,
            PolicyError::Evaluator { .. } => ErrorKind::PolicyDenied,
        }
    }
}
