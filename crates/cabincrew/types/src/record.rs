use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::ApprovalRecord;
use crate::hash::ContentHash;
use crate::ids::{StepId, WorkflowId};
use crate::policy::PolicyEvaluationRecord;
use crate::state::State;
use crate::value::Metadata;

/// Durable record of an artifact, re-verified at take-off.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub artifact_type: String,
    pub artifact_hash: String,
    pub step_id: StepId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Externally visible snapshot of one workflow, reconstructable from the WAL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStateRecord {
    pub workflow_id: WorkflowId,
    pub current_state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token_hash: Option<ContentHash>,
    #[serde(default)]
    pub approvals: Vec<ApprovalRecord>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
    #[serde(default)]
    pub policy_evaluations: Vec<PolicyEvaluationRecord>,
    #[serde(default)]
    pub steps_completed: Vec<StepId>,
    #[serde(default)]
    pub steps_pending: Vec<StepId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}
