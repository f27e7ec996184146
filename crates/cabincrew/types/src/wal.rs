//! WAL entry shape and the typed payload of every entry type.
//!
//! An entry's `data` is externally tagged with its entry type, so a decoded
//! entry whose `entry_type` disagrees with its payload is detectably corrupt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, HashError};
use crate::hash::{hash_canonical, ContentHash};
use crate::ids::{ApprovalId, StepId, WorkflowId};
use crate::plan::PlanToken;
use crate::policy::{AggregationMethod, Decision, PolicyEvaluationRecord, PreflightRequires};
use crate::state::State;
use crate::engine::EngineStatus;
use crate::value::Metadata;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalEntryType {
    WorkflowStarted,
    StepStarted,
    StepCompleted,
    ApprovalRequested,
    ApprovalReceived,
    ArtifactCreated,
    PolicyEvaluated,
    WorkflowCompleted,
    WorkflowFailed,
    IntegrityOverride,
}

impl WalEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalEntryType::WorkflowStarted => "workflow_started",
            WalEntryType::StepStarted => "step_started",
            WalEntryType::StepCompleted => "step_completed",
            WalEntryType::ApprovalRequested => "approval_requested",
            WalEntryType::ApprovalReceived => "approval_received",
            WalEntryType::ArtifactCreated => "artifact_created",
            WalEntryType::PolicyEvaluated => "policy_evaluated",
            WalEntryType::WorkflowCompleted => "workflow_completed",
            WalEntryType::WorkflowFailed => "workflow_failed",
            WalEntryType::IntegrityOverride => "integrity_override",
        }
    }
}

impl std::fmt::Display for WalEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol step a `step_started`/`step_completed` pair brackets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    FlightPlan,
    PlanToken,
    Preflight,
    TakeOff,
    Execution,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepKind::FlightPlan => "flight_plan",
            StepKind::PlanToken => "plan_token",
            StepKind::Preflight => "preflight",
            StepKind::TakeOff => "take_off",
            StepKind::Execution => "execution",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStartedData {
    pub step_id: StepId,
    pub initial_state: State,
    pub engine_id: String,
    pub model: String,
    pub protocol_version: String,
    pub workspace_hash: String,
    /// Opaque engine configuration. Never carries secrets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governance_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_digest: Option<String>,
}

/// Plan-token re-verification performed on take-off entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTokenCheck {
    pub expected: ContentHash,
    pub actual: ContentHash,
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub differences: Vec<String>,
    #[serde(default)]
    pub overridden: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStartedData {
    pub step_id: StepId,
    pub step_type: StepKind,
    #[serde(default)]
    pub run_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token_check: Option<PlanTokenCheck>,
}

/// Engine receipt for a completed engine step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub engine_id: String,
    pub receipt_id: String,
    pub status: EngineStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub step_id: StepId,
    pub step_type: StepKind,
    /// Artifact ids recorded by this step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StepOutcome>,
    /// Set on the `plan_token` step only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token: Option<PlanToken>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequestedData {
    pub approval_id: ApprovalId,
    pub step_id: StepId,
    pub required_role: String,
    pub reason: String,
    pub plan_token_hash: ContentHash,
    /// Hashes of the evidence shown to the approver.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_hashes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalReceivedData {
    pub approval_id: ApprovalId,
    pub approved: bool,
    pub approver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub plan_token_hash: ContentHash,
    pub approved_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCreatedData {
    pub artifact_id: String,
    pub artifact_hash: String,
    pub artifact_type: String,
    pub step_id: StepId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluatedData {
    pub evaluation_id: String,
    pub step_id: StepId,
    pub policy_name: String,
    pub method: AggregationMethod,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<PreflightRequires>,
    /// Individual evaluator results that fed the aggregate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evaluations: Vec<PolicyEvaluationRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCompletedData {
    pub final_state: State,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFailedData {
    pub error: String,
    pub kind: ErrorKind,
    pub from_state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepId>,
}

/// Operator-authorized take-off against a plan that failed verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityOverrideData {
    pub step_id: StepId,
    pub operator: String,
    pub authorization: String,
    pub expected: ContentHash,
    pub actual: ContentHash,
    #[serde(default)]
    pub differences: Vec<String>,
    /// The plan the override authorizes take-off against.
    pub plan_token: PlanToken,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalEntryData {
    WorkflowStarted(WorkflowStartedData),
    StepStarted(StepStartedData),
    StepCompleted(StepCompletedData),
    ApprovalRequested(ApprovalRequestedData),
    ApprovalReceived(ApprovalReceivedData),
    ArtifactCreated(ArtifactCreatedData),
    PolicyEvaluated(PolicyEvaluatedData),
    WorkflowCompleted(WorkflowCompletedData),
    WorkflowFailed(WorkflowFailedData),
    IntegrityOverride(IntegrityOverrideData),
}

impl WalEntryData {
    pub fn entry_type(&self) -> WalEntryType {
        match self {
            WalEntryData::WorkflowStarted(_) => WalEntryType::WorkflowStarted,
            WalEntryData::StepStarted(_) => WalEntryType::StepStarted,
            WalEntryData::StepCompleted(_) => WalEntryType::StepCompleted,
            WalEntryData::ApprovalRequested(_) => WalEntryType::ApprovalRequested,
            WalEntryData::ApprovalReceived(_) => WalEntryType::ApprovalReceived,
            WalEntryData::ArtifactCreated(_) => WalEntryType::ArtifactCreated,
            WalEntryData::PolicyEvaluated(_) => WalEntryType::PolicyEvaluated,
            WalEntryData::WorkflowCompleted(_) => WalEntryType::WorkflowCompleted,
            WalEntryData::WorkflowFailed(_) => WalEntryType::WorkflowFailed,
            WalEntryData::IntegrityOverride(_) => WalEntryType::IntegrityOverride,
        }
    }
}

/// One durable, checksummed workflow event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Starts at 1 and increases by exactly one per workflow.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub workflow_id: WorkflowId,
    pub entry_type: WalEntryType,
    pub data: WalEntryData,
    pub checksum: ContentHash,
}

#[derive(Serialize)]
struct ChecksumInput<'a> {
    entry_type: WalEntryType,
    data: &'a WalEntryData,
    sequence: u64,
    workflow_id: &'a WorkflowId,
    timestamp: &'a DateTime<Utc>,
}

impl WalEntry {
    /// Build a sealed entry with its checksum.
    pub fn seal(
        sequence: u64,
        workflow_id: WorkflowId,
        data: WalEntryData,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, HashError> {
        let entry_type = data.entry_type();
        let checksum = Self::checksum_of(entry_type, &data, sequence, &workflow_id, &timestamp)?;
        Ok(Self {
            sequence,
            timestamp,
            workflow_id,
            entry_type,
            data,
            checksum,
        })
    }

    fn checksum_of(
        entry_type: WalEntryType,
        data: &WalEntryData,
        sequence: u64,
        workflow_id: &WorkflowId,
        timestamp: &DateTime<Utc>,
    ) -> Result<ContentHash, HashError> {
        hash_canonical(&ChecksumInput {
            entry_type,
            data,
            sequence,
            workflow_id,
            timestamp,
        })
    }

    /// Recompute the checksum and check the declared type against the payload.
    pub fn verify(&self) -> bool {
        if self.entry_type != self.data.entry_type() {
            return false;
        }
        match Self::checksum_of(
            self.entry_type,
            &self.data,
            self.sequence,
            &self.workflow_id,
            &self.timestamp,
        ) {
            Ok(expected) => expected == self.checksum,
            Err(_) => false,
        }
    }
}
