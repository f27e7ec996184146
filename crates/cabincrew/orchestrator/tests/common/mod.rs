//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cabincrew_audit::MemoryAuditSink;
use cabincrew_orchestrator::{
    Engine, EngineCredentials, EngineError, Orchestrator, OrchestratorConfig, WorkflowSpec,
};
use cabincrew_policy::{FixedEvaluator, PolicyEvaluator};
use cabincrew_types::{
    hash, EngineArtifact, EngineInput, EngineMode, EngineOutput, EngineStatus, PlanToken, State,
    WorkflowId,
};
use cabincrew_wal::{
    MemoryStorage, SegmentReader, SegmentWriter, WalConfig, WalError, WalStorage, WriteAheadLog,
};
use parking_lot::Mutex;

pub const ENGINE_ID: &str = "terraform";

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

/// Engine double that answers from a script and records every request.
pub struct ScriptedEngine {
    plan: Vec<EngineArtifact>,
    takeoff: Mutex<Option<Vec<EngineArtifact>>>,
    fail: Mutex<Option<EngineMode>>,
    executed_token: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<EngineInput>>,
}

impl ScriptedEngine {
    pub fn new(plan: Vec<EngineArtifact>) -> Self {
        Self {
            plan,
            takeoff: Mutex::new(None),
            fail: Mutex::new(None),
            executed_token: Mutex::new(None),
            delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Artifacts take-off reports instead of the planned ones
    pub fn produce_on_takeoff(&self, artifacts: Vec<EngineArtifact>) {
        *self.takeoff.lock() = Some(artifacts);
    }

    pub fn fail_on(&self, mode: EngineMode) {
        *self.fail.lock() = Some(mode);
    }

    /// Plan token take-off claims it executed
    pub fn report_token(&self, token: impl Into<String>) {
        *self.executed_token.lock() = Some(token.into());
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<EngineInput> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn invoke(&self, input: EngineInput) -> Result<EngineOutput, EngineError> {
        self.calls.lock().push(input.clone());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mode = input.mode;
        let failed = *self.fail.lock() == Some(mode);
        let artifacts = match mode {
            EngineMode::FlightPlan => self.plan.clone(),
            EngineMode::TakeOff => self
                .takeoff
                .lock()
                .clone()
                .unwrap_or_else(|| self.plan.clone()),
        };
        let plan_token = match mode {
            EngineMode::FlightPlan => None,
            EngineMode::TakeOff => self
                .executed_token
                .lock()
                .clone()
                .or(input.expected_plan_token.clone()),
        };

        Ok(EngineOutput {
            protocol_version: input.protocol_version,
            engine_id: ENGINE_ID.to_string(),
            mode,
            receipt_id: format!("receipt-{}-{}", input.meta.workflow_id, mode),
            status: if failed {
                EngineStatus::Failure
            } else {
                EngineStatus::Success
            },
            error: failed.then(|| "provider rejected the request".to_string()),
            warnings: Vec::new(),
            diagnostics: None,
            artifacts: if failed { Vec::new() } else { artifacts },
            metrics: Vec::new(),
            plan_token,
        })
    }
}

// ---------------------------------------------------------------------------
// Faulty storage
// ---------------------------------------------------------------------------

/// Switch for the storage under a harness. A failing sync errors after
/// its bytes were written.
#[derive(Default)]
pub struct StorageFaults {
    syncs_left: Mutex<Option<usize>>,
}

impl StorageFaults {
    pub fn fail_syncs(&self) {
        self.fail_syncs_after(0);
    }

    /// Let `ok` more syncs through, then fail every one after
    pub fn fail_syncs_after(&self, ok: usize) {
        *self.syncs_left.lock() = Some(ok);
    }

    pub fn heal(&self) {
        *self.syncs_left.lock() = None;
    }

    fn check(&self) -> Result<(), WalError> {
        match self.syncs_left.lock().as_mut() {
            Some(0) => Err(WalError::Io(std::io::Error::other("disk unplugged"))),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

struct FaultyStorage {
    inner: MemoryStorage,
    faults: Arc<StorageFaults>,
}

struct FaultyWriter {
    inner: Box<dyn SegmentWriter>,
    faults: Arc<StorageFaults>,
}

impl SegmentWriter for FaultyWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<(), WalError> {
        self.inner.write_all(data)
    }

    fn flush(&mut self) -> Result<(), WalError> {
        self.inner.flush()
    }

    fn sync(&mut self) -> Result<(), WalError> {
        self.faults.check()?;
        self.inner.sync()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }
}

impl FaultyStorage {
    fn wrap(&self, inner: Box<dyn SegmentWriter>) -> Box<dyn SegmentWriter> {
        Box::new(FaultyWriter {
            inner,
            faults: Arc::clone(&self.faults),
        })
    }
}

impl WalStorage for FaultyStorage {
    fn list_workflows(&self) -> Result<Vec<WorkflowId>, WalError> {
        self.inner.list_workflows()
    }

    fn list_segments(&self, workflow_id: &WorkflowId) -> Result<Vec<u64>, WalError> {
        self.inner.list_segments(workflow_id)
    }

    fn create_segment(
        &self,
        workflow_id: &WorkflowId,
        segment_id: u64,
    ) -> Result<Box<dyn SegmentWriter>, WalError> {
        Ok(self.wrap(self.inner.create_segment(workflow_id, segment_id)?))
    }

    fn append_segment(
        &self,
        workflow_id: &WorkflowId,
        segment_id: u64,
    ) -> Result<Box<dyn SegmentWriter>, WalError> {
        Ok(self.wrap(self.inner.append_segment(workflow_id, segment_id)?))
    }

    fn open_segment(
        &self,
        workflow_id: &WorkflowId,
        segment_id: u64,
    ) -> Result<Box<dyn SegmentReader>, WalError> {
        self.inner.open_segment(workflow_id, segment_id)
    }

    fn truncate_segment(
        &self,
        workflow_id: &WorkflowId,
        segment_id: u64,
        len: u64,
    ) -> Result<(), WalError> {
        self.inner.truncate_segment(workflow_id, segment_id, len)
    }

    fn remove_segment(&self, workflow_id: &WorkflowId, segment_id: u64) -> Result<(), WalError> {
        self.inner.remove_segment(workflow_id, segment_id)
    }

    fn archive_workflow(&self, workflow_id: &WorkflowId, dest: &Path) -> Result<(), WalError> {
        self.inner.archive_workflow(workflow_id, dest)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn artifact(name: &str, content: &str) -> EngineArtifact {
    EngineArtifact {
        name: name.to_string(),
        role: "plan".to_string(),
        path: format!("out/{name}"),
        hash: hash(content.as_bytes()).as_str().to_string(),
        size: Some(content.len() as u64),
    }
}

pub fn plan() -> Vec<EngineArtifact> {
    vec![
        artifact("main.tfplan", "resource aws_s3_bucket logs"),
        artifact("summary.json", "{\"add\":1}"),
    ]
}

pub fn wf(id: &str) -> WorkflowId {
    WorkflowId::new(id).unwrap()
}

pub fn spec(id: &str) -> WorkflowSpec {
    WorkflowSpec::new(wf(id), ENGINE_ID, "gpt-4o", "ws-5f1c")
}

pub fn allow_all() -> Arc<dyn PolicyEvaluator> {
    Arc::new(FixedEvaluator::allow_all("baseline"))
}

pub fn deny_all(reason: &str) -> Arc<dyn PolicyEvaluator> {
    Arc::new(FixedEvaluator::deny_all("guardrail", reason))
}

pub fn require_approval(role: &str) -> Arc<dyn PolicyEvaluator> {
    Arc::new(FixedEvaluator::require_approval(
        "change-board",
        role,
        "production change",
    ))
}

/// An orchestrator under test with the handles needed to inspect it
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub engine: Arc<ScriptedEngine>,
    pub audit: Arc<MemoryAuditSink>,
    pub storage: MemoryStorage,
    pub faults: Arc<StorageFaults>,
}

pub struct HarnessBuilder {
    config: OrchestratorConfig,
    wal_config: WalConfig,
    policies: Vec<Arc<dyn PolicyEvaluator>>,
    engine: Arc<ScriptedEngine>,
    storage: MemoryStorage,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::ephemeral(),
            wal_config: WalConfig::default(),
            policies: Vec::new(),
            engine: Arc::new(ScriptedEngine::new(plan())),
            storage: MemoryStorage::new(),
        }
    }

    pub fn policy(mut self, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        self.policies.push(evaluator);
        self
    }

    pub fn allow_override(mut self) -> Self {
        self.config.integrity.allow_override = true;
        self
    }

    pub fn engine_timeout(mut self, secs: u64) -> Self {
        self.config.engine.timeout_secs = secs;
        self
    }

    pub fn engine(mut self, engine: Arc<ScriptedEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn wal_config(mut self, wal_config: WalConfig) -> Self {
        self.wal_config = wal_config;
        self
    }

    /// Share storage with an earlier harness, as a restart would
    pub fn storage(mut self, storage: MemoryStorage) -> Self {
        self.storage = storage;
        self
    }

    pub fn build(self) -> Harness {
        let audit = Arc::new(MemoryAuditSink::new());
        let faults = Arc::new(StorageFaults::default());
        let storage = FaultyStorage {
            inner: self.storage.clone(),
            faults: Arc::clone(&faults),
        };
        let wal = Arc::new(WriteAheadLog::open(self.wal_config, Arc::new(storage)));
        let mut builder = Orchestrator::builder(self.config)
            .wal(wal)
            .engine(self.engine.clone())
            .audit_sink(audit.clone());
        for policy in self.policies {
            builder = builder.policy(policy);
        }
        Harness {
            orchestrator: Arc::new(builder.build().unwrap()),
            engine: self.engine,
            audit,
            storage: self.storage,
            faults,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        HarnessBuilder::new().policy(allow_all()).build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    /// Create the workflow and run it through plan-token creation
    pub async fn plan(&self, id: &str) -> (WorkflowId, PlanToken) {
        let orch = &self.orchestrator;
        let state = orch.create_workflow(spec(id)).await.unwrap();
        assert_eq!(state.state, State::Init);
        let state = orch
            .run_flight_plan(&wf(id), EngineCredentials::none())
            .await
            .unwrap();
        assert_eq!(state.state, State::PlanGenerated);
        let token = orch.create_plan_token(&wf(id)).await.unwrap();
        (wf(id), token)
    }

    /// Run the workflow up to `READY_FOR_TAKEOFF` under allow-only policies
    pub async fn ready(&self, id: &str) -> (WorkflowId, PlanToken) {
        let (workflow_id, token) = self.plan(id).await;
        let decision = self
            .orchestrator
            .run_preflight(&workflow_id, Vec::new())
            .await
            .unwrap();
        assert!(!decision.is_denied());
        let state = self.orchestrator.mark_ready(&workflow_id).await.unwrap();
        assert_eq!(state.state, State::ReadyForTakeoff);
        (workflow_id, token)
    }

    pub async fn entry_types(&self, workflow_id: &WorkflowId) -> Vec<String> {
        self.orchestrator
            .wal_entries(workflow_id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.entry_type.to_string())
            .collect()
    }
}
