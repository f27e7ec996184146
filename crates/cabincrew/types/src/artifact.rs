use serde::{Deserialize, Serialize};

use crate::error::HashError;
use crate::hash::{hash_canonical, ContentHash};
use crate::value::Metadata;

/// Canonical artifact document written by engines.
///
/// `artifact_type` and `action` are free-form and engine-defined.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_type: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub mime: String,
    /// Inline content. String, object, array or null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Artifact {
    pub fn content_hash(&self) -> Result<ContentHash, HashError> {
        hash_canonical(self)
    }
}
