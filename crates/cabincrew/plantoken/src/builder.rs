use std::collections::HashSet;

use cabincrew_types::{
    hash, hash_canonical, ContentHash, EngineArtifact, PlanArtifactHash, PlanToken,
    PLAN_TOKEN_VERSION,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::PlanTokenError;

/// Every plan-token field except `token` itself.
#[derive(Serialize)]
struct TokenFields<'a> {
    version: &'a str,
    artifacts: &'a [PlanArtifactHash],
    model: &'a str,
    engine_id: &'a str,
    protocol_version: &'a str,
    workspace_hash: &'a str,
    created_at: &'a DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    governance_hash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    policy_digest: Option<&'a str>,
}

/// Digest binding all of a plan token's fields except `token`.
pub fn compute_token(plan: &PlanToken) -> Result<ContentHash, PlanTokenError> {
    let fields = TokenFields {
        version: &plan.version,
        artifacts: &plan.artifacts,
        model: &plan.model,
        engine_id: &plan.engine_id,
        protocol_version: &plan.protocol_version,
        workspace_hash: &plan.workspace_hash,
        created_at: &plan.created_at,
        governance_hash: plan.governance_hash.as_deref(),
        policy_digest: plan.policy_digest.as_deref(),
    };
    Ok(hash_canonical(&fields)?)
}

/// Builder for plan tokens.
///
/// `created_at` is an input rather than read from the clock so that two
/// replicas building from the same flight-plan agree on the token.
#[derive(Debug, Clone)]
pub struct PlanTokenBuilder {
    engine_id: String,
    protocol_version: String,
    workspace_hash: String,
    model: String,
    created_at: DateTime<Utc>,
    artifacts: Vec<PlanArtifactHash>,
    governance_hash: Option<String>,
    policy_digest: Option<String>,
}

impl PlanTokenBuilder {
    pub fn new(
        engine_id: impl Into<String>,
        protocol_version: impl Into<String>,
        workspace_hash: impl Into<String>,
        model: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            engine_id: engine_id.into(),
            protocol_version: protocol_version.into(),
            workspace_hash: workspace_hash.into(),
            model: model.into(),
            created_at,
            artifacts: Vec::new(),
            governance_hash: None,
            policy_digest: None,
        }
    }

    /// Add one artifact. Order is significant.
    pub fn artifact(mut self, artifact: PlanArtifactHash) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Add artifacts in order.
    pub fn artifacts(mut self, artifacts: impl IntoIterator<Item = PlanArtifactHash>) -> Self {
        self.artifacts.extend(artifacts);
        self
    }

    /// Add the artifacts an engine reported, in reported order.
    pub fn engine_artifacts<'a>(self, artifacts: impl IntoIterator<Item = &'a EngineArtifact>) -> Self {
        self.artifacts(artifacts.into_iter().map(|a| PlanArtifactHash {
            name: a.name.clone(),
            hash: a.hash.clone(),
            size: a.size,
        }))
    }

    /// Set governance hash
    pub fn governance_hash(mut self, hash: impl Into<String>) -> Self {
        self.governance_hash = Some(hash.into());
        self
    }

    /// Set policy digest
    pub fn policy_digest(mut self, digest: impl Into<String>) -> Self {
        self.policy_digest = Some(digest.into());
        self
    }

    pub fn build(self) -> Result<PlanToken, PlanTokenError> {
        for (field, value) in [
            ("engine_id", &self.engine_id),
            ("protocol_version", &self.protocol_version),
            ("workspace_hash", &self.workspace_hash),
        ] {
            if value.is_empty() {
                return Err(PlanTokenError::InvalidInput(format!("{field} must not be empty")));
            }
        }
        let mut seen = HashSet::new();
        for artifact in &self.artifacts {
            if artifact.name.is_empty() || artifact.hash.is_empty() {
                return Err(PlanTokenError::InvalidInput(
                    "artifact name and hash must not be empty".into(),
                ));
            }
            if !seen.insert(artifact.name.as_str()) {
                return Err(PlanTokenError::DuplicateArtifact(artifact.name.clone()));
            }
        }

        let mut plan = PlanToken {
            // Overwritten once every other field is in place
            token: hash(b""),
            version: PLAN_TOKEN_VERSION.to_string(),
            artifacts: self.artifacts,
            model: self.model,
            engine_id: self.engine_id,
            protocol_version: self.protocol_version,
            workspace_hash: self.workspace_hash,
            created_at: self.created_at,
            governance_hash: self.governance_hash,
            policy_digest: self.policy_digest,
        };
        plan.token = compute_token(&plan)?;
        Ok(plan)
    }
}
