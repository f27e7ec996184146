//! Command surface of the orchestrator
//!
//! Every command follows the same shape: take the workflow's lock, check the
//! state, append to the WAL, fold the committed entry into the snapshot, emit
//! an audit event. Engine and policy calls happen with the lock released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cabincrew_approval::{received_data, requested_data, Acceptance};
use cabincrew_audit::{event_for_entry, AuditSink, TracingAuditSink};
use cabincrew_plantoken::{validate_takeoff_artifacts, verify_plan, PlanTokenBuilder};
use cabincrew_policy::{AggregatedDecision, Aggregator, CustomAggregation, PolicyEvaluator, PolicySet};
use cabincrew_types::{
    ApprovalRequest, ApprovalResponse, ArtifactCreatedData, EngineArtifact, EngineInput,
    EngineMeta, EngineMode, EngineOrchestrator, EngineOutput, ErrorKind, IntegrityOverrideData,
    Metadata, PlanToken, PlanTokenCheck, PolicyEvaluatedData, PolicyEvaluationRecord,
    PreflightEvidence, PreflightInput, State, StepCompletedData, StepId, StepKind, StepOutcome,
    StepStartedData, WalEntry, WalEntryData, WorkflowCompletedData, WorkflowFailedData, WorkflowId,
    WorkflowStartedData, WorkflowState, WorkflowStateRecord,
};
use cabincrew_wal::WriteAheadLog;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::engine::{Engine, EngineCredentials, EngineError, SubprocessEngine};
use crate::error::{OrchestratorError, Result};
use crate::machine::{step_id, WorkflowSnapshot};

/// Everything needed to start a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub workflow_id: WorkflowId,
    pub engine_id: String,
    pub model: String,
    pub workspace_hash: String,
    /// Defaults to the configured protocol version
    #[serde(default)]
    pub protocol_version: Option<String>,
    /// Opaque engine configuration, forwarded verbatim
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub context: Option<Metadata>,
    #[serde(default)]
    pub governance_hash: Option<String>,
    #[serde(default)]
    pub policy_digest: Option<String>,
}

impl WorkflowSpec {
    pub fn new(
        workflow_id: WorkflowId,
        engine_id: impl Into<String>,
        model: impl Into<String>,
        workspace_hash: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id,
            engine_id: engine_id.into(),
            model: model.into(),
            workspace_hash: workspace_hash.into(),
            protocol_version: None,
            config: None,
            context: None,
            governance_hash: None,
            policy_digest: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_context(mut self, context: Metadata) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_governance_hash(mut self, hash: impl Into<String>) -> Self {
        self.governance_hash = Some(hash.into());
        self
    }

    pub fn with_policy_digest(mut self, digest: impl Into<String>) -> Self {
        self.policy_digest = Some(digest.into());
        self
    }
}

/// Operator authorization to take off against a plan that no longer
/// matches the bound token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityOverride {
    pub operator: String,
    /// Change ticket or similar reference
    pub authorization: String,
}

/// Input to [`Orchestrator::take_off`]
#[derive(Debug, Clone, Default)]
pub struct TakeoffCommand {
    /// Plan presented for execution. Defaults to the stored plan.
    pub plan_token: Option<PlanToken>,
    pub override_integrity: Option<IntegrityOverride>,
    pub credentials: EngineCredentials,
}

impl TakeoffCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presenting(mut self, plan: PlanToken) -> Self {
        self.plan_token = Some(plan);
        self
    }

    pub fn with_override(mut self, operator: impl Into<String>, authorization: impl Into<String>) -> Self {
        self.override_integrity = Some(IntegrityOverride {
            operator: operator.into(),
            authorization: authorization.into(),
        });
        self
    }

    pub fn with_credentials(mut self, credentials: EngineCredentials) -> Self {
        self.credentials = credentials;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredWorkflow {
    pub workflow_id: WorkflowId,
    pub state: State,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedWorkflow {
    pub workflow_id: WorkflowId,
    pub reason: String,
}

/// Result of [`Orchestrator::recover`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub recovered: Vec<RecoveredWorkflow>,
    pub quarantined: Vec<QuarantinedWorkflow>,
}

/// One workflow's single writer
struct WorkflowHandle {
    snapshot: Mutex<Option<WorkflowSnapshot>>,
    in_flight: AtomicBool,
}

impl WorkflowHandle {
    fn new(snapshot: Option<WorkflowSnapshot>) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Mark an engine or policy call in flight until the marker drops.
    fn begin_call(&self) -> Option<CallMarker<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CallMarker {
                flag: &self.in_flight,
            })
    }
}

struct CallMarker<'a> {
    flag: &'a AtomicBool,
}

impl Drop for CallMarker<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    wal: Option<Arc<WriteAheadLog>>,
    engine: Option<Arc<dyn Engine>>,
    policies: PolicySet,
    custom: Option<Arc<dyn CustomAggregation>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            wal: None,
            engine: None,
            policies: PolicySet::new(),
            custom: None,
            audit: None,
        }
    }

    /// Use an already open WAL instead of opening one from the config
    pub fn wal(mut self, wal: Arc<WriteAheadLog>) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Use this engine instead of the configured subprocess
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Add a preflight policy evaluator
    pub fn policy(mut self, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        self.policies = self.policies.add_evaluator(evaluator);
        self
    }

    pub fn policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }

    /// Strategy for the `custom` aggregation method
    pub fn custom_aggregation(mut self, strategy: Arc<dyn CustomAggregation>) -> Self {
        self.custom = Some(strategy);
        self
    }

    /// Audit sink. Defaults to logging events through `tracing`.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        let wal = match self.wal {
            Some(wal) => wal,
            None => match &config.wal.data_dir {
                Some(dir) => Arc::new(WriteAheadLog::open_file(config.wal.wal_config(), dir.clone())?),
                None => Arc::new(WriteAheadLog::open_memory(config.wal.wal_config())),
            },
        };
        let engine: Arc<dyn Engine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(SubprocessEngine::from_config(&config.engine)?),
        };
        let mut aggregator = Aggregator::new(config.policy.aggregation_method)
            .with_default_role(config.policy.default_approval_role.clone());
        if let Some(strategy) = self.custom {
            aggregator = aggregator.with_custom_strategy(strategy);
        }
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(TracingAuditSink::new()) as Arc<dyn AuditSink>);

        info!(
            aggregation = %config.policy.aggregation_method,
            policies = self.policies.len(),
            allow_override = config.integrity.allow_override,
            durable = config.wal.data_dir.is_some(),
            "Orchestrator initialized"
        );

        Ok(Orchestrator {
            config,
            wal,
            engine,
            policies: self.policies,
            aggregator,
            audit,
            workflows: DashMap::new(),
            quarantined: DashMap::new(),
        })
    }
}

/// Governed two-phase workflow orchestrator.
///
/// Safe to share between tasks. Commands for different workflows run in
/// parallel; commands for one workflow are serialized.
pub struct Orchestrator {
    config: OrchestratorConfig,
    wal: Arc<WriteAheadLog>,
    engine: Arc<dyn Engine>,
    policies: PolicySet,
    aggregator: Aggregator,
    audit: Arc<dyn AuditSink>,
    workflows: DashMap<WorkflowId, Arc<WorkflowHandle>>,
    quarantined: DashMap<WorkflowId, String>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    // ---- Commands ----

    /// Log `workflow_started` and create the workflow in `INIT`.
    pub async fn create_workflow(&self, spec: WorkflowSpec) -> Result<WorkflowState> {
        for (field, value) in [
            ("engine_id", &spec.engine_id),
            ("workspace_hash", &spec.workspace_hash),
        ] {
            if value.is_empty() {
                return Err(OrchestratorError::InvalidInput(format!("{field} must not be empty")));
            }
        }
        let workflow_id = spec.workflow_id.clone();
        self.ensure_not_quarantined(&workflow_id)?;

        let handle = match self.workflows.entry(workflow_id.clone()) {
            Entry::Occupied(_) => return Err(OrchestratorError::AlreadyExists(workflow_id)),
            Entry::Vacant(vacant) => Arc::clone(vacant.insert(Arc::new(WorkflowHandle::new(None))).value()),
        };

        let mut guard = handle.snapshot.lock().await;
        match self.start_workflow(spec).await {
            Ok(snapshot) => {
                let state = snapshot.workflow_state();
                *guard = Some(snapshot);
                Ok(state)
            }
            Err(e) => {
                drop(guard);
                self.workflows.remove(&workflow_id);
                Err(e)
            }
        }
    }

    async fn start_workflow(&self, spec: WorkflowSpec) -> Result<WorkflowSnapshot> {
        let workflow_id = spec.workflow_id;
        if self.wal.last_sequence(&workflow_id).await? > 0 {
            return Err(OrchestratorError::AlreadyExists(workflow_id));
        }

        let data = WalEntryData::WorkflowStarted(WorkflowStartedData {
            step_id: StepId::new("init"),
            initial_state: State::Init,
            engine_id: spec.engine_id,
            model: spec.model,
            protocol_version: spec
                .protocol_version
                .unwrap_or_else(|| self.config.protocol_version.clone()),
            workspace_hash: spec.workspace_hash,
            config: spec.config,
            context: spec.context,
            governance_hash: spec.governance_hash,
            policy_digest: spec.policy_digest,
        });
        let entry = self.wal.append(&workflow_id, data).await?;
        let snapshot = WorkflowSnapshot::start(&entry)?;
        info!(
            workflow_id = %workflow_id,
            engine_id = %snapshot.started().engine_id,
            "Workflow created"
        );
        self.emit(&entry, None).await;
        Ok(snapshot)
    }

    /// Run the engine's flight-plan and record the artifacts it proposes.
    ///
    /// Also resumes a flight-plan left in `PLAN_RUNNING` by a restart.
    pub async fn run_flight_plan(
        &self,
        workflow_id: &WorkflowId,
        credentials: EngineCredentials,
    ) -> Result<WorkflowState> {
        const COMMAND: &str = "run_flight_plan";
        let step = step_id(StepKind::FlightPlan);
        let handle = self.handle(workflow_id).await?;

        let mut guard = handle.snapshot.lock().await;
        let snapshot = self.settled(&mut guard, workflow_id).await?;
        expect_state(snapshot, &[State::Init, State::PlanRunning], COMMAND)?;
        let call = handle
            .begin_call()
            .ok_or_else(|| OrchestratorError::InFlight(workflow_id.clone()))?;
        if snapshot.state() == State::PlanRunning {
            info!(workflow_id = %workflow_id, "Resuming flight-plan");
        }

        let run_index = snapshot.run_index() + 1;
        self.commit(snapshot, step_started(StepKind::FlightPlan, run_index, None), None)
            .await?;
        let input = engine_input(snapshot, EngineMode::FlightPlan, run_index, None, credentials);
        let expected = snapshot.started().clone();
        drop(guard);

        let result = self.call_engine(input, &expected).await;

        let mut guard = handle.snapshot.lock().await;
        let snapshot = self.active(&mut guard, workflow_id)?;
        expect_state(snapshot, &[State::PlanRunning], COMMAND)?;
        let output = match result {
            Ok(output) => output,
            Err(e) => return Err(self.engine_failed(snapshot, step, e).await),
        };

        // The plan token is built from these later; reject what cannot be bound.
        if let Err(e) = plan_builder(&expected, Utc::now())
            .engine_artifacts(&output.artifacts)
            .build()
        {
            let e = EngineError::Protocol(format!("unusable flight-plan artifacts: {e}"));
            return Err(self.engine_failed(snapshot, step, e).await);
        }

        let artifact_ids = self
            .record_artifacts(snapshot, &step, run_index, &output.artifacts)
            .await?;
        self.commit(
            snapshot,
            WalEntryData::StepCompleted(StepCompletedData {
                step_id: step,
                step_type: StepKind::FlightPlan,
                artifacts: artifact_ids,
                outcome: Some(outcome(&output)),
                plan_token: None,
            }),
            None,
        )
        .await?;
        drop(call);
        Ok(snapshot.workflow_state())
    }

    /// Bind the flight-plan's artifacts into a plan token.
    pub async fn create_plan_token(&self, workflow_id: &WorkflowId) -> Result<PlanToken> {
        let handle = self.handle(workflow_id).await?;
        let mut guard = handle.snapshot.lock().await;
        let snapshot = self.settled(&mut guard, workflow_id).await?;
        expect_state(snapshot, &[State::PlanGenerated], "create_plan_token")?;

        let created_at = snapshot.plan_completed_at().ok_or_else(|| {
            OrchestratorError::InvalidInput("flight-plan completion time is unknown".into())
        })?;
        let plan = plan_builder(snapshot.started(), created_at)
            .engine_artifacts(snapshot.plan_artifacts())
            .build()?;

        self.commit(
            snapshot,
            WalEntryData::StepCompleted(StepCompletedData {
                step_id: step_id(StepKind::PlanToken),
                step_type: StepKind::PlanToken,
                artifacts: Vec::new(),
                outcome: None,
                plan_token: Some(plan.clone()),
            }),
            None,
        )
        .await?;
        info!(
            workflow_id = %workflow_id,
            plan_token = %plan.token.short(),
            artifacts = plan.artifacts.len(),
            "Plan token created"
        );
        Ok(plan)
    }

    /// Evaluate every preflight policy and log the aggregated decision.
    ///
    /// `deny` fails the workflow. `require_approval` leaves it in
    /// `AWAITING_APPROVAL`. An aggregation error leaves the workflow in
    /// `PRE_FLIGHT_RUNNING` so the step can be resumed.
    pub async fn run_preflight(
        &self,
        workflow_id: &WorkflowId,
        evidence: Vec<PreflightEvidence>,
    ) -> Result<AggregatedDecision> {
        const COMMAND: &str = "run_preflight";
        let step = step_id(StepKind::Preflight);
        let handle = self.handle(workflow_id).await?;

        let mut guard = handle.snapshot.lock().await;
        let snapshot = self.settled(&mut guard, workflow_id).await?;
        expect_state(snapshot, &[State::TokenCreated, State::PreFlightRunning], COMMAND)?;
        let call = handle
            .begin_call()
            .ok_or_else(|| OrchestratorError::InFlight(workflow_id.clone()))?;
        let engine_output = snapshot.flight_plan_output().ok_or_else(|| {
            OrchestratorError::InvalidInput("flight-plan output is not recorded".into())
        })?;

        self.commit(snapshot, step_started(StepKind::Preflight, 0, None), None)
            .await?;
        let evidence_hashes: Vec<String> = evidence.iter().map(|e| e.hash.clone()).collect();
        let input = PreflightInput {
            workflow_id: workflow_id.clone(),
            step_id: step.clone(),
            mode: EngineMode::FlightPlan,
            engine_output,
            evidence,
            plan_token: snapshot.plan_token().cloned(),
            context: snapshot.started().context.clone(),
        };
        drop(guard);

        let evaluations = self.policies.evaluate(&input).await;
        let aggregated = self.aggregator.aggregate(evaluations)?;

        let mut guard = handle.snapshot.lock().await;
        let snapshot = self.active(&mut guard, workflow_id)?;
        expect_state(snapshot, &[State::PreFlightRunning], COMMAND)?;

        let data = policy_data(&aggregated, &step, &evidence_hashes);
        self.commit(snapshot, WalEntryData::PolicyEvaluated(data), Some(&aggregated))
            .await?;
        info!(
            workflow_id = %workflow_id,
            decision = %aggregated.decision,
            method = %aggregated.method,
            policies = aggregated.evaluations.len(),
            "Preflight decided"
        );

        if aggregated.is_denied() {
            let reason = if aggregated.violations.is_empty() {
                "preflight policy denied".to_string()
            } else {
                aggregated.violations.join("; ")
            };
            self.fail_workflow(snapshot, ErrorKind::PolicyDenied, reason, Some(step))
                .await?;
            return Err(OrchestratorError::PolicyDenied {
                workflow_id: workflow_id.clone(),
                violations: aggregated.violations,
            });
        }
        drop(call);
        Ok(aggregated)
    }

    /// Ask for a human decision on the current plan.
    ///
    /// Retrying returns the request that is already pending for the
    /// current plan instead of issuing a second one.
    pub async fn request_approval(
        &self,
        workflow_id: &WorkflowId,
        evidence: Vec<PreflightEvidence>,
    ) -> Result<ApprovalRequest> {
        let handle = self.handle(workflow_id).await?;
        let mut guard = handle.snapshot.lock().await;
        let snapshot = self.settled(&mut guard, workflow_id).await?;
        expect_state(snapshot, &[State::AwaitingApproval], "request_approval")?;
        let plan_token_hash = snapshot
            .plan_token_hash()
            .cloned()
            .ok_or_else(|| OrchestratorError::InvalidInput("no plan token to approve".into()))?;

        if let Some(pending) = snapshot
            .approvals()
            .pending()
            .find(|p| p.plan_token_hash == plan_token_hash)
        {
            return Ok(ApprovalRequest {
                approval_id: pending.approval_id.clone(),
                workflow_id: workflow_id.clone(),
                step_id: pending.step_id.clone(),
                reason: pending.reason.clone(),
                required_role: pending.required_role.clone(),
                plan_token_hash,
                evidence,
            });
        }

        let requires = snapshot.policy().and_then(|p| p.requires.clone()).unwrap_or_default();
        let role = requires
            .role
            .unwrap_or_else(|| self.config.policy.default_approval_role.clone());
        let reason = requires
            .reason
            .unwrap_or_else(|| "preflight requires approval".to_string());
        let request = snapshot.approvals().request(
            step_id(StepKind::Preflight),
            role,
            reason,
            plan_token_hash,
            evidence,
        )?;

        self.commit(
            snapshot,
            WalEntryData::ApprovalRequested(requested_data(&request)),
            None,
        )
        .await?;
        info!(
            workflow_id = %workflow_id,
            approval_id = %request.approval_id,
            role = %request.required_role,
            "Approval requested"
        );
        Ok(request)
    }

    /// Record an approver's decision.
    ///
    /// A response identical to one already accepted returns the current
    /// state without logging anything. A denial fails the workflow.
    pub async fn receive_approval(
        &self,
        workflow_id: &WorkflowId,
        response: ApprovalResponse,
    ) -> Result<WorkflowState> {
        let handle = self.handle(workflow_id).await?;
        let mut guard = handle.snapshot.lock().await;
        let snapshot = self.active(&mut guard, workflow_id)?;
        if snapshot.is_terminal() {
            return Err(OrchestratorError::TerminalState {
                workflow_id: workflow_id.clone(),
                state: snapshot.state(),
            });
        }
        let plan_token_hash = snapshot
            .plan_token_hash()
            .cloned()
            .ok_or_else(|| OrchestratorError::IllegalTransition {
                workflow_id: workflow_id.clone(),
                state: snapshot.state(),
                command: "receive_approval",
            })?;

        let record = match snapshot.approvals().accept(&response, &plan_token_hash, Utc::now()) {
            Ok(Acceptance::Duplicate(_)) => {
                // The denial may be logged without its workflow_failed
                self.settle(snapshot).await?;
                return Ok(snapshot.workflow_state());
            }
            Ok(Acceptance::New(record)) => record,
            Err(e) => {
                warn!(
                    workflow_id = %workflow_id,
                    approval_id = %response.approval_id,
                    error = %e,
                    "Approval response rejected"
                );
                return Err(e.into());
            }
        };
        expect_state(snapshot, &[State::AwaitingApproval], "receive_approval")?;

        self.commit(snapshot, WalEntryData::ApprovalReceived(received_data(&record)), None)
            .await?;
        if !record.approved {
            let reason = match &record.reason {
                Some(reason) => format!("approval denied by {}: {reason}", record.approver),
                None => format!("approval denied by {}", record.approver),
            };
            self.fail_workflow(snapshot, ErrorKind::PolicyDenied, reason, Some(record.step_id))
                .await?;
        }
        Ok(snapshot.workflow_state())
    }

    /// Close preflight and make the workflow ready for take-off.
    pub async fn mark_ready(&self, workflow_id: &WorkflowId) -> Result<WorkflowState> {
        let handle = self.handle(workflow_id).await?;
        let mut guard = handle.snapshot.lock().await;
        let snapshot = self.settled(&mut guard, workflow_id).await?;
        expect_state(snapshot, &[State::PreflightComplete, State::Approved], "mark_ready")?;

        self.commit(
            snapshot,
            WalEntryData::StepCompleted(StepCompletedData {
                step_id: step_id(StepKind::Preflight),
                step_type: StepKind::Preflight,
                artifacts: Vec::new(),
                outcome: None,
                plan_token: None,
            }),
            None,
        )
        .await?;
        Ok(snapshot.workflow_state())
    }

    /// Re-verify the plan, run the engine's take-off and check that it
    /// produced exactly the planned artifacts.
    pub async fn take_off(
        &self,
        workflow_id: &WorkflowId,
        command: TakeoffCommand,
    ) -> Result<WorkflowStateRecord> {
        const COMMAND: &str = "take_off";
        let step = step_id(StepKind::TakeOff);
        let handle = self.handle(workflow_id).await?;

        let mut guard = handle.snapshot.lock().await;
        let snapshot = self.settled(&mut guard, workflow_id).await?;
        expect_state(snapshot, &[State::ReadyForTakeoff], COMMAND)?;
        let call = handle
            .begin_call()
            .ok_or_else(|| OrchestratorError::InFlight(workflow_id.clone()))?;
        let stored = snapshot
            .plan_token()
            .cloned()
            .ok_or_else(|| OrchestratorError::InvalidInput("no plan token to execute".into()))?;
        let presented = command.plan_token.unwrap_or_else(|| stored.clone());

        let verification = verify_plan(&stored, &presented)?;
        let mut check = PlanTokenCheck {
            expected: stored.token.clone(),
            actual: verification.actual.clone(),
            matched: verification.matched,
            differences: verification.differences.clone(),
            overridden: false,
        };
        let plan = if verification.matched {
            stored
        } else {
            warn!(
                workflow_id = %workflow_id,
                expected = %stored.token.short(),
                actual = %verification.actual.short(),
                differences = ?verification.differences,
                "Plan token mismatch at take-off"
            );
            let authorized = command
                .override_integrity
                .filter(|o| !o.operator.is_empty() && !o.authorization.is_empty());
            // A forged token field cannot be overridden: only the recomputed digest is bindable.
            let consistent = presented.token == verification.actual;
            match authorized {
                Some(authorized) if self.config.integrity.allow_override && consistent => {
                    self.commit(
                        snapshot,
                        WalEntryData::IntegrityOverride(IntegrityOverrideData {
                            step_id: step.clone(),
                            operator: authorized.operator.clone(),
                            authorization: authorized.authorization.clone(),
                            expected: stored.token.clone(),
                            actual: verification.actual.clone(),
                            differences: verification.differences.clone(),
                            plan_token: presented.clone(),
                        }),
                        None,
                    )
                    .await?;
                    warn!(
                        workflow_id = %workflow_id,
                        operator = %authorized.operator,
                        authorization = %authorized.authorization,
                        "Integrity override accepted"
                    );
                    check.overridden = true;
                    presented
                }
                requested => {
                    if requested.is_some() {
                        warn!(workflow_id = %workflow_id, "Integrity override refused");
                    }
                    let differences = verification.differences;
                    self.fail_workflow(
                        snapshot,
                        ErrorKind::IntegrityViolation,
                        differences.join("; "),
                        Some(step),
                    )
                    .await?;
                    return Err(OrchestratorError::IntegrityViolation {
                        workflow_id: workflow_id.clone(),
                        differences,
                    });
                }
            }
        };

        let run_index = snapshot.run_index() + 1;
        self.commit(
            snapshot,
            step_started(StepKind::TakeOff, run_index, Some(check)),
            None,
        )
        .await?;
        let input = engine_input(
            snapshot,
            EngineMode::TakeOff,
            run_index,
            Some(plan.token.to_string()),
            command.credentials,
        );
        let expected = snapshot.started().clone();
        drop(guard);

        let result = self.call_engine(input, &expected).await;

        let mut guard = handle.snapshot.lock().await;
        let snapshot = self.active(&mut guard, workflow_id)?;
        expect_state(snapshot, &[State::TakeoffRunning], COMMAND)?;
        let output = match result {
            Ok(output) => output,
            Err(e) => return Err(self.engine_failed(snapshot, step, e).await),
        };

        let mut differences = Vec::new();
        if let Some(executed) = &output.plan_token {
            if executed != plan.token.as_str() {
                differences.push(format!(
                    "engine executed plan token {executed}, expected {}",
                    plan.token
                ));
            }
        }
        differences.extend(validate_takeoff_artifacts(&plan, &output.artifacts).differences);
        if !differences.is_empty() {
            warn!(
                workflow_id = %workflow_id,
                differences = ?differences,
                "Take-off artifacts do not match the plan"
            );
            self.fail_workflow(
                snapshot,
                ErrorKind::IntegrityViolation,
                differences.join("; "),
                Some(step),
            )
            .await?;
            return Err(OrchestratorError::IntegrityViolation {
                workflow_id: workflow_id.clone(),
                differences,
            });
        }

        let artifact_ids = self
            .record_artifacts(snapshot, &step, run_index, &output.artifacts)
            .await?;
        self.commit(
            snapshot,
            WalEntryData::StepCompleted(StepCompletedData {
                step_id: step,
                step_type: StepKind::TakeOff,
                artifacts: artifact_ids.clone(),
                outcome: Some(outcome(&output)),
                plan_token: None,
            }),
            None,
        )
        .await?;
        self.commit(
            snapshot,
            WalEntryData::StepCompleted(StepCompletedData {
                step_id: step_id(StepKind::Execution),
                step_type: StepKind::Execution,
                artifacts: Vec::new(),
                outcome: None,
                plan_token: None,
            }),
            None,
        )
        .await?;
        self.commit(
            snapshot,
            WalEntryData::WorkflowCompleted(WorkflowCompletedData {
                final_state: State::Completed,
                artifacts: artifact_ids,
            }),
            None,
        )
        .await?;
        info!(
            workflow_id = %workflow_id,
            plan_token = %plan.token.short(),
            artifacts = output.artifacts.len(),
            "Workflow completed"
        );
        drop(call);
        Ok(snapshot.record())
    }

    /// Fail a workflow on operator request.
    ///
    /// Allowed while an engine call is in flight; its result is then discarded.
    pub async fn fail(
        &self,
        workflow_id: &WorkflowId,
        kind: ErrorKind,
        reason: impl Into<String>,
    ) -> Result<WorkflowState> {
        let handle = self.handle(workflow_id).await?;
        let mut guard = handle.snapshot.lock().await;
        let snapshot = self.settled(&mut guard, workflow_id).await?;
        if snapshot.is_terminal() {
            return Err(OrchestratorError::TerminalState {
                workflow_id: workflow_id.clone(),
                state: snapshot.state(),
            });
        }
        let step = snapshot.workflow_state().step_id;
        self.fail_workflow(snapshot, kind, reason.into(), Some(step)).await?;
        Ok(snapshot.workflow_state())
    }

    // ---- Queries ----

    pub async fn state(&self, workflow_id: &WorkflowId) -> Result<WorkflowState> {
        let handle = self.handle(workflow_id).await?;
        let mut guard = handle.snapshot.lock().await;
        Ok(self.active(&mut guard, workflow_id)?.workflow_state())
    }

    pub async fn record(&self, workflow_id: &WorkflowId) -> Result<WorkflowStateRecord> {
        let handle = self.handle(workflow_id).await?;
        let mut guard = handle.snapshot.lock().await;
        Ok(self.active(&mut guard, workflow_id)?.record())
    }

    /// The plan token take-off will be checked against, once created
    pub async fn plan_token(&self, workflow_id: &WorkflowId) -> Result<Option<PlanToken>> {
        let handle = self.handle(workflow_id).await?;
        let mut guard = handle.snapshot.lock().await;
        Ok(self.active(&mut guard, workflow_id)?.plan_token().cloned())
    }

    /// The workflow's committed WAL entries, in sequence order
    pub async fn wal_entries(&self, workflow_id: &WorkflowId) -> Result<Vec<WalEntry>> {
        let entries = self.wal.entries(workflow_id).await?;
        if entries.is_empty() {
            return Err(OrchestratorError::NotFound(workflow_id.clone()));
        }
        Ok(entries)
    }

    /// Workflows currently loaded
    pub fn workflow_ids(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<WorkflowId> = self.workflows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Reason a workflow was quarantined, if it was
    pub fn quarantine_reason(&self, workflow_id: &WorkflowId) -> Option<String> {
        self.quarantined.get(workflow_id).map(|r| r.value().clone())
    }

    // ---- Recovery ----

    /// Rebuild every workflow in storage from its WAL.
    ///
    /// Workflows whose log fails verification are quarantined. A denial
    /// that was logged without its `workflow_failed` entry is completed.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for workflow_id in self.wal.workflows()? {
            if let Some(reason) = self.quarantine_reason(&workflow_id) {
                report.quarantined.push(QuarantinedWorkflow { workflow_id, reason });
                continue;
            }
            let handle = match self.handle(&workflow_id).await {
                Ok(handle) => handle,
                Err(OrchestratorError::Quarantined { workflow_id, reason }) => {
                    report.quarantined.push(QuarantinedWorkflow { workflow_id, reason });
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut guard = handle.snapshot.lock().await;
            if let Some(snapshot) = guard.as_mut() {
                self.settle(snapshot).await?;
                report.recovered.push(RecoveredWorkflow {
                    workflow_id,
                    state: snapshot.state(),
                    last_sequence: snapshot.last_sequence(),
                });
            }
        }

        info!(
            recovered = report.recovered.len(),
            quarantined = report.quarantined.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    // ---- Internals ----

    fn ensure_not_quarantined(&self, workflow_id: &WorkflowId) -> Result<()> {
        match self.quarantine_reason(workflow_id) {
            Some(reason) => Err(OrchestratorError::Quarantined {
                workflow_id: workflow_id.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// The workflow's handle, loading it from the WAL on first use. A load
    /// completes any failure the log decided but never wrote.
    async fn handle(&self, workflow_id: &WorkflowId) -> Result<Arc<WorkflowHandle>> {
        self.ensure_not_quarantined(workflow_id)?;
        if let Some(handle) = self.workflows.get(workflow_id) {
            return Ok(Arc::clone(handle.value()));
        }
        let snapshot = self.load(workflow_id).await?;
        let handle = Arc::clone(
            self.workflows
                .entry(workflow_id.clone())
                .or_insert_with(|| Arc::new(WorkflowHandle::new(Some(snapshot))))
                .value(),
        );
        let mut guard = handle.snapshot.lock().await;
        if let Some(snapshot) = guard.as_mut() {
            self.settle(snapshot).await?;
        }
        drop(guard);
        Ok(handle)
    }

    /// Snapshot behind a locked handle
    fn active<'a>(
        &self,
        slot: &'a mut Option<WorkflowSnapshot>,
        workflow_id: &WorkflowId,
    ) -> Result<&'a mut WorkflowSnapshot> {
        self.ensure_not_quarantined(workflow_id)?;
        slot.as_mut()
            .ok_or_else(|| OrchestratorError::NotFound(workflow_id.clone()))
    }

    /// Like [`Self::active`], but first writes any `workflow_failed` a
    /// logged denial still owes. Commands use this, queries do not.
    async fn settled<'a>(
        &self,
        slot: &'a mut Option<WorkflowSnapshot>,
        workflow_id: &WorkflowId,
    ) -> Result<&'a mut WorkflowSnapshot> {
        let snapshot = self.active(slot, workflow_id)?;
        self.settle(snapshot).await?;
        Ok(snapshot)
    }

    async fn settle(&self, snapshot: &mut WorkflowSnapshot) -> Result<()> {
        if let Some((kind, reason)) = snapshot.unresolved_failure() {
            info!(workflow_id = %snapshot.workflow_id(), "Completing interrupted failure");
            let step = snapshot.workflow_state().step_id;
            self.fail_workflow(snapshot, kind, reason, Some(step)).await?;
        }
        Ok(())
    }

    async fn load(&self, workflow_id: &WorkflowId) -> Result<WorkflowSnapshot> {
        let entries = match self.wal.entries(workflow_id).await {
            Ok(entries) => entries,
            Err(e) if e.is_integrity_failure() => {
                return Err(self.quarantine(workflow_id, e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        match WorkflowSnapshot::fold(&entries) {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err(OrchestratorError::NotFound(workflow_id.clone())),
            Err(e) => Err(self.quarantine(workflow_id, e.to_string())),
        }
    }

    fn quarantine(&self, workflow_id: &WorkflowId, reason: String) -> OrchestratorError {
        error!(workflow_id = %workflow_id, reason = %reason, "Workflow quarantined");
        self.workflows.remove(workflow_id);
        self.quarantined.insert(workflow_id.clone(), reason.clone());
        OrchestratorError::Quarantined {
            workflow_id: workflow_id.clone(),
            reason,
        }
    }

    /// Append `data` and fold it in. Nothing is logged if `data` is not
    /// legal in the current state.
    async fn commit(
        &self,
        snapshot: &mut WorkflowSnapshot,
        data: WalEntryData,
        policy: Option<&AggregatedDecision>,
    ) -> Result<WalEntry> {
        snapshot.check(&data)?;
        let workflow_id = snapshot.workflow_id().clone();
        let entry = self.wal.append(&workflow_id, data).await?;
        if let Err(e) = snapshot.apply(&entry) {
            return Err(self.quarantine(&workflow_id, e.to_string()));
        }
        info!(
            workflow_id = %workflow_id,
            sequence = entry.sequence,
            entry_type = %entry.entry_type,
            state = %snapshot.state(),
            "Transition committed"
        );
        self.emit(&entry, policy.map(|p| (p, snapshot.state()))).await;
        Ok(entry)
    }

    async fn emit(&self, entry: &WalEntry, policy: Option<(&AggregatedDecision, State)>) {
        let mut builder = event_for_entry(entry);
        if let Some((decision, state)) = policy {
            builder = builder.policy(decision.to_audit(state));
        }
        if let Err(e) = self.audit.emit(builder.build()).await {
            warn!(
                workflow_id = %entry.workflow_id,
                sequence = entry.sequence,
                error = %e,
                "Audit sink rejected event"
            );
        }
    }

    async fn fail_workflow(
        &self,
        snapshot: &mut WorkflowSnapshot,
        kind: ErrorKind,
        error: String,
        failed_step: Option<StepId>,
    ) -> Result<()> {
        let from_state = snapshot.state();
        self.commit(
            snapshot,
            WalEntryData::WorkflowFailed(WorkflowFailedData {
                error: error.clone(),
                kind,
                from_state,
                failed_step,
            }),
            None,
        )
        .await?;
        warn!(
            workflow_id = %snapshot.workflow_id(),
            kind = %kind,
            from_state = %from_state,
            error = %error,
            "Workflow failed"
        );
        Ok(())
    }

    /// Fail the workflow for an engine error and build the error to return.
    async fn engine_failed(
        &self,
        snapshot: &mut WorkflowSnapshot,
        step: StepId,
        error: EngineError,
    ) -> OrchestratorError {
        let message = error.to_string();
        if let Err(e) = self
            .fail_workflow(snapshot, ErrorKind::EngineFailure, message.clone(), Some(step))
            .await
        {
            return e;
        }
        OrchestratorError::EngineFailure {
            workflow_id: snapshot.workflow_id().clone(),
            message,
        }
    }

    /// Invoke the engine under the configured timeout and check that the
    /// answer belongs to the request.
    async fn call_engine(
        &self,
        input: EngineInput,
        started: &WorkflowStartedData,
    ) -> std::result::Result<EngineOutput, EngineError> {
        let mode = input.mode;
        let timeout = self.config.engine.timeout();
        let output = tokio::time::timeout(timeout, self.engine.invoke(input))
            .await
            .map_err(|_| EngineError::Timeout(timeout))??;

        if output.mode != mode {
            return Err(EngineError::Protocol(format!(
                "answered {} to a {mode} request",
                output.mode
            )));
        }
        if output.engine_id != started.engine_id {
            return Err(EngineError::Protocol(format!(
                "engine identified as {}, workflow uses {}",
                output.engine_id, started.engine_id
            )));
        }
        if output.protocol_version != started.protocol_version {
            return Err(EngineError::Protocol(format!(
                "protocol version {}, expected {}",
                output.protocol_version, started.protocol_version
            )));
        }
        if !output.is_success() {
            return Err(EngineError::Failed(
                output
                    .error
                    .unwrap_or_else(|| "no error message".to_string()),
            ));
        }
        Ok(output)
    }

    async fn record_artifacts(
        &self,
        snapshot: &mut WorkflowSnapshot,
        step: &StepId,
        run_index: u64,
        artifacts: &[EngineArtifact],
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let artifact_id = format!("{step}/{run_index}/{}", artifact.name);
            self.commit(
                snapshot,
                WalEntryData::ArtifactCreated(ArtifactCreatedData {
                    artifact_id: artifact_id.clone(),
                    artifact_hash: artifact.hash.clone(),
                    artifact_type: artifact.role.clone(),
                    step_id: step.clone(),
                    name: artifact.name.clone(),
                    path: (!artifact.path.is_empty()).then(|| artifact.path.clone()),
                    size: artifact.size,
                }),
                None,
            )
            .await?;
            ids.push(artifact_id);
        }
        Ok(ids)
    }
}

fn expect_state(snapshot: &WorkflowSnapshot, allowed: &[State], command: &'static str) -> Result<()> {
    let state = snapshot.state();
    if state.is_terminal() {
        return Err(OrchestratorError::TerminalState {
            workflow_id: snapshot.workflow_id().clone(),
            state,
        });
    }
    if !allowed.contains(&state) {
        warn!(
            workflow_id = %snapshot.workflow_id(),
            state = %state,
            command,
            "Command rejected"
        );
        return Err(OrchestratorError::IllegalTransition {
            workflow_id: snapshot.workflow_id().clone(),
            state,
            command,
        });
    }
    Ok(())
}

fn step_started(kind: StepKind, run_index: u64, check: Option<PlanTokenCheck>) -> WalEntryData {
    WalEntryData::StepStarted(StepStartedData {
        step_id: step_id(kind),
        step_type: kind,
        run_index,
        plan_token_check: check,
    })
}

fn outcome(output: &EngineOutput) -> StepOutcome {
    StepOutcome {
        engine_id: output.engine_id.clone(),
        receipt_id: output.receipt_id.clone(),
        status: output.status,
        warnings: output.warnings.clone(),
    }
}

fn plan_builder(started: &WorkflowStartedData, created_at: DateTime<Utc>) -> PlanTokenBuilder {
    let mut builder = PlanTokenBuilder::new(
        started.engine_id.clone(),
        started.protocol_version.clone(),
        started.workspace_hash.clone(),
        started.model.clone(),
        created_at,
    );
    if let Some(hash) = &started.governance_hash {
        builder = builder.governance_hash(hash.clone());
    }
    if let Some(digest) = &started.policy_digest {
        builder = builder.policy_digest(digest.clone());
    }
    builder
}

fn engine_input(
    snapshot: &WorkflowSnapshot,
    mode: EngineMode,
    run_index: u64,
    expected_plan_token: Option<String>,
    credentials: EngineCredentials,
) -> EngineInput {
    let started = snapshot.started();
    let step = match mode {
        EngineMode::FlightPlan => StepKind::FlightPlan,
        EngineMode::TakeOff => StepKind::TakeOff,
    };
    let mut input = EngineInput {
        protocol_version: started.protocol_version.clone(),
        mode,
        meta: EngineMeta {
            workflow_id: snapshot.workflow_id().clone(),
            step_id: step_id(step),
        },
        config: started.config.clone(),
        secrets: None,
        allowed_secrets: Vec::new(),
        identity_token: None,
        context: started.context.clone(),
        orchestrator: Some(EngineOrchestrator {
            run_index: Some(run_index),
            workspace_hash: Some(started.workspace_hash.clone()),
            artifacts_salt: None,
        }),
        expected_plan_token,
    };
    credentials.apply(&mut input);
    input
}

fn policy_data(
    aggregated: &AggregatedDecision,
    step: &StepId,
    evidence_hashes: &[String],
) -> PolicyEvaluatedData {
    let reason = aggregated
        .requires
        .as_ref()
        .and_then(|r| r.reason.clone())
        .or_else(|| aggregated.violations.first().cloned());
    PolicyEvaluatedData {
        evaluation_id: Uuid::new_v4().to_string(),
        step_id: step.clone(),
        policy_name: format!("preflight:{}", aggregated.method),
        method: aggregated.method,
        decision: aggregated.decision,
        reason,
        violations: aggregated.violations.clone(),
        warnings: aggregated.warnings.clone(),
        requires: aggregated.requires.clone(),
        evaluations: aggregated
            .evaluations
            .iter()
            .map(|e| PolicyEvaluationRecord {
                evaluation_id: Uuid::new_v4().to_string(),
                step_id: step.clone(),
                policy_name: e.policy_id.clone(),
                decision: e.decision,
                evaluated_at: e.evaluated_at,
                reason: e.reason.clone(),
                evidence_hashes: evidence_hashes.to_vec(),
            })
            .collect(),
    }
}
