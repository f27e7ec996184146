//! Audit event construction

use cabincrew_types::{
    AuditApproval, AuditArtifact, AuditEngine, AuditEvent, AuditGateway, AuditIntegrity,
    AuditPolicy, AuditSeverity, AuditWorkflow, Decision, EngineMode, PlanToken, StepId, StepKind,
    WalEntry, WalEntryData, WorkflowId,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Builder for audit events
#[derive(Debug, Clone)]
pub struct AuditEventBuilder {
    event: AuditEvent,
}

impl AuditEventBuilder {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event: AuditEvent {
                event_id: Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
                event_type: event_type.into(),
                workflow: None,
                engine: None,
                plan_token: None,
                artifacts: Vec::new(),
                policy: None,
                approval: None,
                integrity_check: None,
                gateway: None,
                message: None,
                severity: AuditSeverity::Info,
                chain_hash: None,
                signature: None,
            },
        }
    }

    /// Set timestamp
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.event.timestamp = timestamp;
        self
    }

    /// Set workflow and step
    pub fn workflow(mut self, workflow_id: &WorkflowId, step_id: Option<&StepId>) -> Self {
        let workflow = self.event.workflow.get_or_insert_with(AuditWorkflow::default);
        workflow.workflow_id = Some(workflow_id.clone());
        workflow.step_id = step_id.cloned();
        self
    }

    /// Set engine mode
    pub fn mode(mut self, mode: EngineMode) -> Self {
        let workflow = self.event.workflow.get_or_insert_with(AuditWorkflow::default);
        workflow.mode = Some(mode.as_str().to_string());
        self
    }

    /// Set engine
    pub fn engine(mut self, engine: AuditEngine) -> Self {
        self.event.engine = Some(engine);
        self
    }

    /// Set plan token
    pub fn plan_token(mut self, plan_token: PlanToken) -> Self {
        self.event.plan_token = Some(plan_token);
        self
    }

    /// Add an artifact
    pub fn artifact(mut self, artifact: AuditArtifact) -> Self {
        self.event.artifacts.push(artifact);
        self
    }

    /// Set policy
    pub fn policy(mut self, policy: AuditPolicy) -> Self {
        self.event.policy = Some(policy);
        self
    }

    /// Set approval
    pub fn approval(mut self, approval: AuditApproval) -> Self {
        self.event.approval = Some(approval);
        self
    }

    /// Set integrity check
    pub fn integrity(mut self, integrity: AuditIntegrity) -> Self {
        self.event.integrity_check = Some(integrity);
        self
    }

    /// Set gateway
    pub fn gateway(mut self, gateway: AuditGateway) -> Self {
        self.event.gateway = Some(gateway);
        self
    }

    /// Set message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.event.message = Some(message.into());
        self
    }

    /// Set severity
    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.event.severity = severity;
        self
    }

    pub fn build(self) -> AuditEvent {
        self.event
    }
}

fn step_mode(kind: StepKind) -> Option<EngineMode> {
    match kind {
        StepKind::FlightPlan => Some(EngineMode::FlightPlan),
        StepKind::TakeOff => Some(EngineMode::TakeOff),
        _ => None,
    }
}

/// Audit event describing a committed WAL entry.
///
/// The result is a builder so the caller can attach context the WAL does not
/// carry, such as the full policy evaluations.
pub fn event_for_entry(entry: &WalEntry) -> AuditEventBuilder {
    let builder = AuditEventBuilder::new(format!("workflow.{}", entry.entry_type))
        .timestamp(entry.timestamp);
    let wf = &entry.workflow_id;

    match &entry.data {
        WalEntryData::WorkflowStarted(data) => builder
            .workflow(wf, Some(&data.step_id))
            .engine(AuditEngine {
                engine_id: Some(data.engine_id.clone()),
                ..AuditEngine::default()
            })
            .message(format!("workflow started with engine {}", data.engine_id)),

        WalEntryData::StepStarted(data) => {
            let mut builder = builder
                .workflow(wf, Some(&data.step_id))
                .message(format!("step {} started", data.step_type));
            if let Some(mode) = step_mode(data.step_type) {
                builder = builder.mode(mode);
            }
            if let Some(check) = &data.plan_token_check {
                builder = builder.integrity(AuditIntegrity {
                    expected_plan_token: Some(check.expected.to_string()),
                    actual_plan_token: Some(check.actual.to_string()),
                    plan_token_match: Some(check.matched),
                    artifacts_match: None,
                    differences: check.differences.clone(),
                });
                if check.overridden {
                    builder = builder.severity(AuditSeverity::Warning);
                }
            }
            builder
        }

        WalEntryData::StepCompleted(data) => {
            let mut builder = builder
                .workflow(wf, Some(&data.step_id))
                .message(format!("step {} completed", data.step_type));
            if let Some(mode) = step_mode(data.step_type) {
                builder = builder.mode(mode);
            }
            if let Some(outcome) = &data.outcome {
                builder = builder.engine(AuditEngine {
                    engine_id: Some(outcome.engine_id.clone()),
                    receipt_id: Some(outcome.receipt_id.clone()),
                    status: Some(outcome.status.as_str().to_string()),
                    error: None,
                });
            }
            if let Some(plan) = &data.plan_token {
                builder = builder.plan_token(plan.clone());
            }
            if data.step_type == StepKind::TakeOff {
                builder = builder.integrity(AuditIntegrity {
                    artifacts_match: Some(true),
                    ..AuditIntegrity::default()
                });
            }
            builder
        }

        WalEntryData::ArtifactCreated(data) => builder
            .workflow(wf, Some(&data.step_id))
            .artifact(AuditArtifact {
                name: Some(data.name.clone()),
                role: Some(data.artifact_type.clone()),
                path: data.path.clone(),
                hash: Some(data.artifact_hash.clone()),
                size: data.size,
            })
            .message(format!("artifact {} recorded", data.name)),

        WalEntryData::PolicyEvaluated(data) => builder
            .workflow(wf, Some(&data.step_id))
            .policy(AuditPolicy {
                aggregation_method: Some(data.method),
                decision: Some(data.decision),
                violations: data.violations.clone(),
                warnings: data.warnings.clone(),
                ..AuditPolicy::default()
            })
            .severity(match data.decision {
                Decision::Deny => AuditSeverity::Warning,
                _ => AuditSeverity::Info,
            })
            .message(format!("preflight decision {}", data.decision)),

        WalEntryData::ApprovalRequested(data) => builder
            .workflow(wf, Some(&data.step_id))
            .approval(AuditApproval {
                approval_id: Some(data.approval_id.to_string()),
                required_role: Some(data.required_role.clone()),
                reason: Some(data.reason.clone()),
                ..AuditApproval::default()
            })
            .message(format!("approval requested from {}", data.required_role)),

        WalEntryData::ApprovalReceived(data) => builder
            .workflow(wf, None)
            .approval(AuditApproval {
                approval_id: Some(data.approval_id.to_string()),
                approved: Some(data.approved),
                approver: Some(data.approver.clone()),
                reason: data.reason.clone(),
                ..AuditApproval::default()
            })
            .message(if data.approved {
                format!("approved by {}", data.approver)
            } else {
                format!("denied by {}", data.approver)
            }),

        WalEntryData::WorkflowCompleted(data) => builder
            .workflow(wf, None)
            .message(format!(
                "workflow completed with {} artifacts",
                data.artifacts.len()
            )),

        WalEntryData::WorkflowFailed(data) => builder
            .workflow(wf, data.failed_step.as_ref())
            .severity(AuditSeverity::Error)
            .message(format!("{} in {}: {}", data.kind, data.from_state, data.error)),

        WalEntryData::IntegrityOverride(data) => builder
            .workflow(wf, Some(&data.step_id))
            .integrity(AuditIntegrity {
                expected_plan_token: Some(data.expected.to_string()),
                actual_plan_token: Some(data.actual.to_string()),
                plan_token_match: Some(false),
                artifacts_match: None,
                differences: data.differences.clone(),
            })
            .plan_token(data.plan_token.clone())
            .severity(AuditSeverity::Critical)
            .message(format!(
                "integrity override by {} ({})",
                data.operator, data.authorization
            )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabincrew_types::{ErrorKind, State, WorkflowFailedData};

    #[test]
    fn failed_entry_is_an_error_event() {
        let wf = WorkflowId::new("wf-audit").unwrap();
        let entry = WalEntry::seal(
            7,
            wf.clone(),
            WalEntryData::WorkflowFailed(WorkflowFailedData {
                error: "engine exited 2".into(),
                kind: ErrorKind::EngineFailure,
                from_state: State::PlanRunning,
                failed_step: Some(StepId::new("flight-plan")),
            }),
            Utc::now(),
        )
        .unwrap();

        let event = event_for_entry(&entry).build();
        assert_eq!(event.event_type, "workflow.workflow_failed");
        assert_eq!(event.severity, AuditSeverity::Error);
        assert_eq!(event.timestamp, entry.timestamp);
        let workflow = event.workflow.unwrap();
        assert_eq!(workflow.workflow_id, Some(wf));
        assert_eq!(workflow.step_id, Some(StepId::new("flight-plan")));
        assert_eq!(
            event.message.as_deref(),
            Some("engine_failure in PLAN_RUNNING: engine exited 2")
        );
    }

    #[test]
    fn builder_sets_fields() {
        let event = AuditEventBuilder::new("gateway.llm")
            .gateway(AuditGateway {
                gateway_type: Some("llm".into()),
                ..AuditGateway::default()
            })
            .severity(AuditSeverity::Debug)
            .build();
        assert_eq!(event.event_type, "gateway.llm");
        assert!(event.gateway.is_some());
        assert!(event.chain_hash.is_none());
        assert_eq!(event.severity, AuditSeverity::Debug);
    }
}
