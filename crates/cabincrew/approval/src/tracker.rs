//! Approval tracker: pending human decisions for one workflow
//!
//! Every request is bound to the plan-token hash current when it was issued.
//! A response is only accepted while that binding still holds, so an approval
//! can never carry over to a plan the approver did not see.
//!
//! The tracker follows log-then-apply: [`ApprovalTracker::request`] and
//! [`ApprovalTracker::accept`] only decide, and the state changes once the
//! matching WAL entry is applied. Replay drives the same `apply` path.

use std::collections::BTreeMap;

use cabincrew_types::{
    ApprovalId, ApprovalReceivedData, ApprovalRecord, ApprovalRequest, ApprovalRequestedData,
    ApprovalResponse, ContentHash, PreflightEvidence, StepId, WalEntry, WalEntryData, WorkflowId,
};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::ApprovalError;

/// Result of accepting a response
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acceptance {
    /// New decision. Log it, then apply it.
    New(ApprovalRecord),
    /// Same decision was already accepted; nothing to log.
    Duplicate(ApprovalRecord),
}

impl Acceptance {
    pub fn record(&self) -> &ApprovalRecord {
        match self {
            Acceptance::New(record) | Acceptance::Duplicate(record) => record,
        }
    }
}

/// Approval state of one workflow
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalTracker {
    workflow_id: WorkflowId,
    pending: BTreeMap<ApprovalId, ApprovalRequestedData>,
    decided: Vec<ApprovalRecord>,
}

impl ApprovalTracker {
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            pending: BTreeMap::new(),
            decided: Vec::new(),
        }
    }

    /// Rebuild from a workflow's WAL, in sequence order.
    pub fn rebuild<'a>(workflow_id: WorkflowId, entries: impl IntoIterator<Item = &'a WalEntry>) -> Self {
        let mut tracker = Self::new(workflow_id);
        for entry in entries {
            tracker.apply(&entry.data);
        }
        tracker
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// Draft a request with a fresh id. Nothing is pending until the
    /// `approval_requested` entry is applied.
    pub fn request(
        &self,
        step_id: StepId,
        required_role: impl Into<String>,
        reason: impl Into<String>,
        plan_token_hash: ContentHash,
        evidence: Vec<PreflightEvidence>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let required_role = required_role.into();
        if required_role.is_empty() {
            return Err(ApprovalError::InvalidRequest("required_role"));
        }
        let reason = reason.into();
        if reason.is_empty() {
            return Err(ApprovalError::InvalidRequest("reason"));
        }
        Ok(ApprovalRequest {
            approval_id: ApprovalId::generate(),
            workflow_id: self.workflow_id.clone(),
            step_id,
            reason,
            required_role,
            plan_token_hash,
            evidence,
        })
    }

    /// Check a response against the pending requests and the workflow's
    /// current plan-token hash.
    pub fn accept(
        &self,
        response: &ApprovalResponse,
        current_plan_token_hash: &ContentHash,
        now: DateTime<Utc>,
    ) -> Result<Acceptance, ApprovalError> {
        if let Some(record) = self.record(&response.approval_id) {
            let same = record.approved == response.approved
                && response.approver.as_deref() == Some(record.approver.as_str());
            return if same {
                Ok(Acceptance::Duplicate(record.clone()))
            } else {
                Err(ApprovalError::AlreadyDecided(response.approval_id.clone()))
            };
        }

        let pending = self
            .pending
            .get(&response.approval_id)
            .ok_or_else(|| ApprovalError::UnknownApproval(response.approval_id.clone()))?;

        if &pending.plan_token_hash != current_plan_token_hash {
            return Err(ApprovalError::StalePlanToken {
                approval_id: response.approval_id.clone(),
                bound: pending.plan_token_hash.clone(),
                current: current_plan_token_hash.clone(),
            });
        }
        if let Some(echoed) = &response.plan_token_hash {
            if echoed != current_plan_token_hash {
                return Err(ApprovalError::StalePlanToken {
                    approval_id: response.approval_id.clone(),
                    bound: echoed.clone(),
                    current: current_plan_token_hash.clone(),
                });
            }
        }
        let approver = match response.approver.as_deref() {
            Some(approver) if !approver.is_empty() => approver.to_string(),
            _ => return Err(ApprovalError::MissingApprover(response.approval_id.clone())),
        };

        Ok(Acceptance::New(ApprovalRecord {
            approval_id: response.approval_id.clone(),
            step_id: pending.step_id.clone(),
            plan_token_hash: pending.plan_token_hash.clone(),
            required_role: pending.required_role.clone(),
            approved: response.approved,
            approver,
            reason: response.reason.clone(),
            approved_at: response.timestamp.unwrap_or(now),
            evidence_hashes: pending.evidence_hashes.clone(),
        }))
    }

    /// Apply an approval WAL payload. Other entry types are ignored.
    pub fn apply(&mut self, data: &WalEntryData) {
        match data {
            WalEntryData::ApprovalRequested(requested) => self.apply_requested(requested),
            WalEntryData::ApprovalReceived(received) => {
                self.apply_received(received);
            }
            _ => {}
        }
    }

    pub fn apply_requested(&mut self, data: &ApprovalRequestedData) {
        debug!(
            workflow_id = %self.workflow_id,
            approval_id = %data.approval_id,
            role = %data.required_role,
            "Approval pending"
        );
        self.pending.insert(data.approval_id.clone(), data.clone());
    }

    /// Move a pending request to decided. Returns the new record.
    pub fn apply_received(&mut self, data: &ApprovalReceivedData) -> Option<ApprovalRecord> {
        let Some(pending) = self.pending.remove(&data.approval_id) else {
            warn!(
                workflow_id = %self.workflow_id,
                approval_id = %data.approval_id,
                "Approval received for a request that is not pending"
            );
            return None;
        };
        let record = ApprovalRecord {
            approval_id: data.approval_id.clone(),
            step_id: pending.step_id,
            plan_token_hash: data.plan_token_hash.clone(),
            required_role: pending.required_role,
            approved: data.approved,
            approver: data.approver.clone(),
            reason: data.reason.clone(),
            approved_at: data.approved_at,
            evidence_hashes: pending.evidence_hashes,
        };
        self.decided.push(record.clone());
        Some(record)
    }

    pub fn pending(&self) -> impl Iterator<Item = &ApprovalRequestedData> {
        self.pending.values()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Decided approvals in the order they were received
    pub fn records(&self) -> &[ApprovalRecord] {
        &self.decided
    }

    pub fn record(&self, approval_id: &ApprovalId) -> Option<&ApprovalRecord> {
        self.decided.iter().find(|r| &r.approval_id == approval_id)
    }
}

/// WAL payload for an issued request
pub fn requested_data(request: &ApprovalRequest) -> ApprovalRequestedData {
    ApprovalRequestedData {
        approval_id: request.approval_id.clone(),
        step_id: request.step_id.clone(),
        required_role: request.required_role.clone(),
        reason: request.reason.clone(),
        plan_token_hash: request.plan_token_hash.clone(),
        evidence_hashes: request.evidence.iter().map(|e| e.hash.clone()).collect(),
    }
}

/// WAL payload for an accepted decision
pub fn received_data(record: &ApprovalRecord) -> ApprovalReceivedData {
    ApprovalReceivedData {
        approval_id: record.approval_id.clone(),
        approved: record.approved,
        approver: record.approver.clone(),
        reason: record.reason.clone(),
        plan_token_hash: record.plan_token_hash.clone(),
        approved_at: record.approved_at,
    }
}
