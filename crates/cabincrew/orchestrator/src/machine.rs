//! Workflow state machine
//!
//! A workflow's state is a left fold of its WAL. [`WorkflowSnapshot::check`]
//! decides whether an entry is legal before it is appended and
//! [`WorkflowSnapshot::apply`] folds it in afterwards, so the live path and
//! replay share one transition function.

use cabincrew_approval::ApprovalTracker;
use cabincrew_types::{
    ArtifactRecord, Decision, EngineArtifact, EngineMode, EngineOutput, ErrorKind, Metadata,
    PlanToken, PolicyEvaluatedData, PolicyEvaluationRecord, State, StepId, StepKind, StepOutcome,
    Value, WalEntry, WalEntryData, WalEntryType, WorkflowFailedData, WorkflowId,
    WorkflowStartedData, WorkflowState, WorkflowStateRecord,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Protocol steps in execution order
pub const STEP_ORDER: [StepKind; 5] = [
    StepKind::FlightPlan,
    StepKind::PlanToken,
    StepKind::Preflight,
    StepKind::TakeOff,
    StepKind::Execution,
];

/// Step id used for every entry of one protocol step
pub fn step_id(kind: StepKind) -> StepId {
    StepId::new(match kind {
        StepKind::FlightPlan => "flight-plan",
        StepKind::PlanToken => "plan-token",
        StepKind::Preflight => "preflight",
        StepKind::TakeOff => "take-off",
        StepKind::Execution => "execution",
    })
}

/// A WAL entry that cannot be folded into the workflow
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{entry_type} is not legal for workflow {workflow_id} in state {state}: {reason}")]
    Illegal {
        workflow_id: WorkflowId,
        state: State,
        entry_type: WalEntryType,
        reason: String,
    },

    #[error("workflow {workflow_id} is {state}")]
    Terminal { workflow_id: WorkflowId, state: State },

    #[error("workflow {workflow_id} must start with workflow_started, found {entry_type}")]
    NotStarted {
        workflow_id: WorkflowId,
        entry_type: WalEntryType,
    },

    #[error("entry {sequence} belongs to workflow {found}, expected {expected}")]
    ForeignEntry {
        expected: WorkflowId,
        found: WorkflowId,
        sequence: u64,
    },

    #[error("workflow {workflow_id}: expected sequence {expected}, found {found}")]
    OutOfOrder {
        workflow_id: WorkflowId,
        expected: u64,
        found: u64,
    },

    #[error("workflow {workflow_id}: entry {sequence} fails checksum verification")]
    Checksum { workflow_id: WorkflowId, sequence: u64 },
}

impl TransitionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransitionError::Illegal { .. } => ErrorKind::IllegalTransition,
            TransitionError::Terminal { .. } => ErrorKind::TerminalState,
            TransitionError::NotStarted { .. }
            | TransitionError::ForeignEntry { .. }
            | TransitionError::OutOfOrder { .. }
            | TransitionError::Checksum { .. } => ErrorKind::IntegrityViolation,
        }
    }
}

/// Everything known about one workflow after folding its WAL.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowSnapshot {
    workflow_id: WorkflowId,
    state: State,
    started: WorkflowStartedData,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_sequence: u64,
    run_index: u64,
    current_step: StepId,
    /// Artifacts recorded while the flight-plan ran
    plan_artifacts: Vec<EngineArtifact>,
    flight_plan: Option<StepOutcome>,
    /// When the flight-plan completed. Used as the plan token's `created_at`.
    plan_completed_at: Option<DateTime<Utc>>,
    plan_token: Option<PlanToken>,
    overridden: bool,
    takeoff_artifacts: Vec<EngineArtifact>,
    policy: Option<PolicyEvaluatedData>,
    approvals: ApprovalTracker,
    artifacts: Vec<ArtifactRecord>,
    policy_records: Vec<PolicyEvaluationRecord>,
    steps_completed: Vec<StepId>,
    failure: Option<WorkflowFailedData>,
}

impl WorkflowSnapshot {
    /// Create a snapshot from a workflow's first entry.
    pub fn start(entry: &WalEntry) -> Result<Self, TransitionError> {
        let workflow_id = entry.workflow_id.clone();
        if !entry.verify() {
            return Err(TransitionError::Checksum {
                workflow_id,
                sequence: entry.sequence,
            });
        }
        if entry.sequence != 1 {
            return Err(TransitionError::OutOfOrder {
                workflow_id,
                expected: 1,
                found: entry.sequence,
            });
        }
        let WalEntryData::WorkflowStarted(started) = &entry.data else {
            return Err(TransitionError::NotStarted {
                workflow_id,
                entry_type: entry.entry_type,
            });
        };
        if started.initial_state != State::Init {
            return Err(TransitionError::Illegal {
                workflow_id,
                state: started.initial_state,
                entry_type: entry.entry_type,
                reason: "workflows start in INIT".into(),
            });
        }

        Ok(Self {
            approvals: ApprovalTracker::new(workflow_id.clone()),
            workflow_id,
            state: State::Init,
            started: started.clone(),
            created_at: entry.timestamp,
            updated_at: entry.timestamp,
            last_sequence: entry.sequence,
            run_index: 0,
            current_step: started.step_id.clone(),
            plan_artifacts: Vec::new(),
            flight_plan: None,
            plan_completed_at: None,
            plan_token: None,
            overridden: false,
            takeoff_artifacts: Vec::new(),
            policy: None,
            artifacts: Vec::new(),
            policy_records: Vec::new(),
            steps_completed: Vec::new(),
            failure: None,
        })
    }

    /// Fold a workflow's entries in sequence order. Empty input folds to `None`.
    pub fn fold<'a>(
        entries: impl IntoIterator<Item = &'a WalEntry>,
    ) -> Result<Option<Self>, TransitionError> {
        let mut entries = entries.into_iter();
        let Some(first) = entries.next() else {
            return Ok(None);
        };
        let mut snapshot = Self::start(first)?;
        for entry in entries {
            snapshot.apply(entry)?;
        }
        Ok(Some(snapshot))
    }

    /// State the workflow would be in after `data`, or why `data` is not legal now.
    pub fn check(&self, data: &WalEntryData) -> Result<State, TransitionError> {
        let state = self.state;
        if state.is_terminal() {
            return Err(TransitionError::Terminal {
                workflow_id: self.workflow_id.clone(),
                state,
            });
        }
        let illegal = |reason: &str| TransitionError::Illegal {
            workflow_id: self.workflow_id.clone(),
            state,
            entry_type: data.entry_type(),
            reason: reason.to_string(),
        };
        if !matches!(data, WalEntryData::WorkflowFailed(_)) && self.unresolved_failure().is_some() {
            return Err(illegal("a logged denial is waiting for workflow_failed"));
        }

        let next = match data {
            WalEntryData::WorkflowStarted(_) => return Err(illegal("workflow already started")),

            WalEntryData::StepStarted(started) => match (started.step_type, state) {
                (StepKind::FlightPlan, State::Init | State::PlanRunning) => State::PlanRunning,
                (StepKind::Preflight, State::TokenCreated | State::PreFlightRunning) => {
                    State::PreFlightRunning
                }
                (StepKind::TakeOff, State::ReadyForTakeoff) => {
                    let check = started
                        .plan_token_check
                        .as_ref()
                        .ok_or_else(|| illegal("take-off without a plan-token check"))?;
                    if !check.matched && !(check.overridden && self.overridden) {
                        return Err(illegal("plan-token check failed"));
                    }
                    State::TakeoffRunning
                }
                _ => return Err(illegal("step cannot start here")),
            },

            WalEntryData::ArtifactCreated(_) => match state {
                State::PlanRunning | State::TakeoffRunning => state,
                _ => return Err(illegal("no engine step is running")),
            },

            WalEntryData::StepCompleted(completed) => match (completed.step_type, state) {
                (StepKind::FlightPlan, State::PlanRunning) => State::PlanGenerated,
                (StepKind::PlanToken, State::PlanGenerated) => {
                    if completed.plan_token.is_none() {
                        return Err(illegal("plan-token step completed without a token"));
                    }
                    State::TokenCreated
                }
                (StepKind::Preflight, State::PreflightComplete | State::Approved) => {
                    State::ReadyForTakeoff
                }
                (StepKind::TakeOff, State::TakeoffRunning) => State::ArtifactsValidated,
                (StepKind::Execution, State::ArtifactsValidated) => State::ExecutionComplete,
                _ => return Err(illegal("step cannot complete here")),
            },

            WalEntryData::PolicyEvaluated(evaluated) => {
                if state != State::PreFlightRunning {
                    return Err(illegal("preflight is not running"));
                }
                if self.policy.is_some() {
                    return Err(illegal("preflight already decided"));
                }
                match evaluated.decision {
                    Decision::Allow | Decision::Warn => State::PreflightComplete,
                    Decision::RequireApproval => State::AwaitingApproval,
                    // workflow_failed follows
                    Decision::Deny => State::PreFlightRunning,
                }
            }

            WalEntryData::ApprovalRequested(requested) => {
                if state != State::AwaitingApproval {
                    return Err(illegal("no approval is required"));
                }
                if self.plan_token_hash() != Some(&requested.plan_token_hash) {
                    return Err(illegal("approval is bound to a different plan token"));
                }
                State::AwaitingApproval
            }

            WalEntryData::ApprovalReceived(received) => {
                if state != State::AwaitingApproval {
                    return Err(illegal("no approval is pending"));
                }
                if !self
                    .approvals
                    .pending()
                    .any(|p| p.approval_id == received.approval_id)
                {
                    return Err(illegal("approval was not requested"));
                }
                if received.approved {
                    State::Approved
                } else {
                    // workflow_failed follows
                    State::AwaitingApproval
                }
            }

            WalEntryData::WorkflowCompleted(_) => match state {
                State::ExecutionComplete => State::Completed,
                _ => return Err(illegal("execution is not complete")),
            },

            WalEntryData::WorkflowFailed(_) => State::Failed,

            WalEntryData::IntegrityOverride(_) => match state {
                State::ReadyForTakeoff => State::ReadyForTakeoff,
                _ => return Err(illegal("overrides are only recorded before take-off")),
            },
        };

        if next != state && !state.can_transition_to(next) {
            return Err(illegal("no such edge"));
        }
        Ok(next)
    }

    /// Fold one committed entry into the snapshot.
    ///
    /// On error the snapshot is unchanged.
    pub fn apply(&mut self, entry: &WalEntry) -> Result<(), TransitionError> {
        if entry.workflow_id != self.workflow_id {
            return Err(TransitionError::ForeignEntry {
                expected: self.workflow_id.clone(),
                found: entry.workflow_id.clone(),
                sequence: entry.sequence,
            });
        }
        if entry.sequence != self.last_sequence + 1 {
            return Err(TransitionError::OutOfOrder {
                workflow_id: self.workflow_id.clone(),
                expected: self.last_sequence + 1,
                found: entry.sequence,
            });
        }
        if !entry.verify() {
            return Err(TransitionError::Checksum {
                workflow_id: self.workflow_id.clone(),
                sequence: entry.sequence,
            });
        }
        let next = self.check(&entry.data)?;

        match &entry.data {
            WalEntryData::WorkflowStarted(_) => {}

            WalEntryData::StepStarted(started) => {
                self.current_step = started.step_id.clone();
                self.run_index = self.run_index.max(started.run_index);
                match started.step_type {
                    StepKind::FlightPlan => {
                        self.plan_artifacts.clear();
                        self.flight_plan = None;
                        self.artifacts.retain(|a| a.step_id != started.step_id);
                    }
                    StepKind::TakeOff => {
                        self.takeoff_artifacts.clear();
                        self.artifacts.retain(|a| a.step_id != started.step_id);
                    }
                    StepKind::Preflight => self.policy = None,
                    StepKind::PlanToken | StepKind::Execution => {}
                }
            }

            WalEntryData::ArtifactCreated(created) => {
                let artifact = EngineArtifact {
                    name: created.name.clone(),
                    role: created.artifact_type.clone(),
                    path: created.path.clone().unwrap_or_default(),
                    hash: created.artifact_hash.clone(),
                    size: created.size,
                };
                if self.state == State::PlanRunning {
                    self.plan_artifacts.push(artifact);
                } else {
                    self.takeoff_artifacts.push(artifact);
                }

                let mut metadata = Metadata::new();
                metadata.insert("name".into(), Value::String(created.name.clone()));
                if let Some(path) = &created.path {
                    metadata.insert("path".into(), Value::String(path.clone()));
                }
                self.artifacts.push(ArtifactRecord {
                    artifact_id: created.artifact_id.clone(),
                    artifact_type: created.artifact_type.clone(),
                    artifact_hash: created.artifact_hash.clone(),
                    step_id: created.step_id.clone(),
                    created_at: entry.timestamp,
                    size: created.size,
                    metadata: Some(metadata),
                });
            }

            WalEntryData::StepCompleted(completed) => {
                self.current_step = completed.step_id.clone();
                if !self.steps_completed.contains(&completed.step_id) {
                    self.steps_completed.push(completed.step_id.clone());
                }
                match completed.step_type {
                    StepKind::FlightPlan => {
                        self.flight_plan = completed.outcome.clone();
                        self.plan_completed_at = Some(entry.timestamp);
                    }
                    StepKind::PlanToken => self.plan_token = completed.plan_token.clone(),
                    StepKind::Preflight | StepKind::TakeOff | StepKind::Execution => {}
                }
            }

            WalEntryData::PolicyEvaluated(evaluated) => {
                self.policy_records.extend(evaluated.evaluations.iter().cloned());
                self.policy_records.push(PolicyEvaluationRecord {
                    evaluation_id: evaluated.evaluation_id.clone(),
                    step_id: evaluated.step_id.clone(),
                    policy_name: evaluated.policy_name.clone(),
                    decision: evaluated.decision,
                    evaluated_at: entry.timestamp,
                    reason: evaluated.reason.clone(),
                    evidence_hashes: Vec::new(),
                });
                self.policy = Some(evaluated.clone());
            }

            WalEntryData::ApprovalRequested(_) | WalEntryData::ApprovalReceived(_) => {
                self.approvals.apply(&entry.data);
            }

            WalEntryData::WorkflowCompleted(_) => {}

            WalEntryData::WorkflowFailed(failed) => self.failure = Some(failed.clone()),

            WalEntryData::IntegrityOverride(data) => {
                self.current_step = data.step_id.clone();
                self.plan_token = Some(data.plan_token.clone());
                self.overridden = true;
            }
        }

        self.state = next;
        self.last_sequence = entry.sequence;
        self.updated_at = entry.timestamp;
        Ok(())
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The `workflow_started` payload
    pub fn started(&self) -> &WorkflowStartedData {
        &self.started
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Highest engine run index recorded so far
    pub fn run_index(&self) -> u64 {
        self.run_index
    }

    /// The plan token take-off is checked against.
    ///
    /// After an integrity override this is the token the operator accepted.
    pub fn plan_token(&self) -> Option<&PlanToken> {
        self.plan_token.as_ref()
    }

    pub fn plan_token_hash(&self) -> Option<&cabincrew_types::ContentHash> {
        self.plan_token.as_ref().map(|p| &p.token)
    }

    pub fn overridden(&self) -> bool {
        self.overridden
    }

    pub fn plan_artifacts(&self) -> &[EngineArtifact] {
        &self.plan_artifacts
    }

    pub fn plan_completed_at(&self) -> Option<DateTime<Utc>> {
        self.plan_completed_at
    }

    pub fn takeoff_artifacts(&self) -> &[EngineArtifact] {
        &self.takeoff_artifacts
    }

    /// Last preflight decision
    pub fn policy(&self) -> Option<&PolicyEvaluatedData> {
        self.policy.as_ref()
    }

    pub fn approvals(&self) -> &ApprovalTracker {
        &self.approvals
    }

    pub fn failure(&self) -> Option<&WorkflowFailedData> {
        self.failure.as_ref()
    }

    /// Flight-plan result as the engine reported it, rebuilt from the WAL.
    ///
    /// Diagnostics and metrics are not logged and come back empty.
    pub fn flight_plan_output(&self) -> Option<EngineOutput> {
        let outcome = self.flight_plan.as_ref()?;
        Some(EngineOutput {
            protocol_version: self.started.protocol_version.clone(),
            engine_id: outcome.engine_id.clone(),
            mode: EngineMode::FlightPlan,
            receipt_id: outcome.receipt_id.clone(),
            status: outcome.status,
            error: None,
            warnings: outcome.warnings.clone(),
            diagnostics: None,
            artifacts: self.plan_artifacts.clone(),
            metrics: Vec::new(),
            plan_token: None,
        })
    }

    /// A decision that failed the workflow but whose `workflow_failed` entry
    /// was never written.
    pub fn unresolved_failure(&self) -> Option<(ErrorKind, String)> {
        match self.state {
            State::PreFlightRunning => {
                let policy = self.policy.as_ref().filter(|p| p.decision == Decision::Deny)?;
                let reason = policy
                    .reason
                    .clone()
                    .unwrap_or_else(|| "preflight policy denied".to_string());
                Some((ErrorKind::PolicyDenied, reason))
            }
            State::AwaitingApproval if !self.approvals.has_pending() => {
                let denied = self.approvals.records().iter().rev().find(|r| !r.approved)?;
                Some((
                    ErrorKind::PolicyDenied,
                    format!("approval {} denied by {}", denied.approval_id, denied.approver),
                ))
            }
            _ => None,
        }
    }

    /// Steps not completed yet. Empty once the workflow is terminal.
    pub fn steps_pending(&self) -> Vec<StepId> {
        if self.is_terminal() {
            return Vec::new();
        }
        STEP_ORDER
            .iter()
            .map(|kind| step_id(*kind))
            .filter(|id| !self.steps_completed.contains(id))
            .collect()
    }

    /// Compact state returned from commands
    pub fn workflow_state(&self) -> WorkflowState {
        WorkflowState {
            state: self.state,
            workflow_id: self.workflow_id.clone(),
            step_id: self.current_step.clone(),
            plan_token_hash: self.plan_token_hash().cloned(),
            last_decision: self.policy.as_ref().map(|p| p.decision),
        }
    }

    /// Full externally visible record
    pub fn record(&self) -> WorkflowStateRecord {
        WorkflowStateRecord {
            workflow_id: self.workflow_id.clone(),
            current_state: self.state,
            plan_token_hash: self.plan_token_hash().cloned(),
            approvals: self.approvals.records().to_vec(),
            artifacts: self.artifacts.clone(),
            policy_evaluations: self.policy_records.clone(),
            steps_completed: self.steps_completed.clone(),
            steps_pending: self.steps_pending(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            metadata: self.started.context.clone(),
        }
    }
}
