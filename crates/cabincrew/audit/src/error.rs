//! Error types for audit emission

use cabincrew_types::HashError;
use thiserror::Error;

/// Result type for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Hash(#[from] HashError),

    /// Stored chain head cannot be parsed
    #[error("audit chain state is invalid: {0}")]
    Chain(String),
}
