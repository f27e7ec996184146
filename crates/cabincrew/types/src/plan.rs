use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// Current plan-token format version.
pub const PLAN_TOKEN_VERSION: &str = "1";

/// Hash of one artifact produced during flight-plan. Order-significant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanArtifactHash {
    pub name: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Binding between a flight-plan's artifacts and the take-off that applies them.
///
/// Built once per workflow and immutable afterwards. `token` is the digest of
/// every other field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanToken {
    pub token: ContentHash,
    pub version: String,
    pub artifacts: Vec<PlanArtifactHash>,
    pub model: String,
    pub engine_id: String,
    pub protocol_version: String,
    pub workspace_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governance_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_digest: Option<String>,
}

impl PlanToken {
    pub fn artifact(&self, name: &str) -> Option<&PlanArtifactHash> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}
