use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::ids::{ApprovalId, StepId, WorkflowId};
use crate::policy::PreflightEvidence;

/// Outbound request for a human decision, bound to one plan-token hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: ApprovalId,
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub reason: String,
    pub required_role: String,
    pub plan_token_hash: ContentHash,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<PreflightEvidence>,
}

/// Inbound decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approval_id: ApprovalId,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Plan-token hash the approver saw, when the approval channel echoes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token_hash: Option<ContentHash>,
}

impl ApprovalResponse {
    pub fn approve(approval_id: ApprovalId, approver: impl Into<String>) -> Self {
        Self {
            approval_id,
            approved: true,
            approver: Some(approver.into()),
            reason: None,
            timestamp: None,
            plan_token_hash: None,
        }
    }

    pub fn deny(approval_id: ApprovalId, approver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approval_id,
            approved: false,
            approver: Some(approver.into()),
            reason: Some(reason.into()),
            timestamp: None,
            plan_token_hash: None,
        }
    }

    pub fn bound_to(mut self, plan_token_hash: ContentHash) -> Self {
        self.plan_token_hash = Some(plan_token_hash);
        self
    }
}

/// Immutable record of an accepted response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approval_id: ApprovalId,
    pub step_id: StepId,
    pub plan_token_hash: ContentHash,
    pub required_role: String,
    pub approved: bool,
    pub approver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub approved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_hashes: Vec<String>,
}
