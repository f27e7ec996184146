//! Restart and crash recovery from the write-ahead log.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cabincrew_orchestrator::{
    EngineCredentials, Orchestrator, OrchestratorConfig, OrchestratorError, TakeoffCommand,
};
use cabincrew_types::{
    AggregationMethod, ApprovalResponse, Decision, ErrorKind, PolicyEvaluatedData, State,
    StepKind, StepStartedData, WalEntryData,
};
use common::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A second orchestrator over the first one's storage
fn restart(previous: &Harness) -> Harness {
    Harness::builder()
        .policy(allow_all())
        .storage(previous.storage.clone())
        .build()
}

async fn wait_for_engine(engine: &ScriptedEngine, calls: usize) {
    while engine.calls().len() < calls {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restart_continues_where_the_log_ends() {
    let first = Harness::new();
    let (workflow_id, token) = first.plan("wf-restart").await;

    let second = restart(&first);
    let report = second.orchestrator.recover().await.unwrap();
    assert!(report.quarantined.is_empty());
    assert_eq!(report.recovered.len(), 1);
    assert_eq!(report.recovered[0].workflow_id, workflow_id);
    assert_eq!(report.recovered[0].state, State::TokenCreated);

    assert_eq!(
        second.orchestrator.plan_token(&workflow_id).await.unwrap(),
        Some(token)
    );
    second
        .orchestrator
        .run_preflight(&workflow_id, Vec::new())
        .await
        .unwrap();
    second.orchestrator.mark_ready(&workflow_id).await.unwrap();
    let record = second
        .orchestrator
        .take_off(&workflow_id, TakeoffCommand::new())
        .await
        .unwrap();
    assert_eq!(record.current_state, State::Completed);
}

#[tokio::test]
async fn recovered_state_matches_the_live_state() {
    let first = Harness::builder()
        .policy(allow_all())
        .policy(require_approval("sre-lead"))
        .build();
    let (workflow_id, _) = first.plan("wf-same").await;
    first
        .orchestrator
        .run_preflight(&workflow_id, Vec::new())
        .await
        .unwrap();
    first
        .orchestrator
        .request_approval(&workflow_id, Vec::new())
        .await
        .unwrap();
    let live = first.orchestrator.record(&workflow_id).await.unwrap();

    let second = restart(&first);
    second.orchestrator.recover().await.unwrap();
    let recovered = second.orchestrator.record(&workflow_id).await.unwrap();
    assert_eq!(recovered, live);
}

#[tokio::test]
async fn workflows_load_lazily_without_recover() {
    let first = Harness::new();
    let (workflow_id, _) = first.ready("wf-lazy").await;

    let second = restart(&first);
    assert!(second.orchestrator.workflow_ids().is_empty());
    let state = second.orchestrator.state(&workflow_id).await.unwrap();
    assert_eq!(state.state, State::ReadyForTakeoff);
    assert_eq!(second.orchestrator.workflow_ids(), vec![workflow_id]);
}

#[tokio::test]
async fn restarting_over_an_existing_id_is_refused() {
    let first = Harness::new();
    first.plan("wf-taken").await;

    let second = restart(&first);
    let err = second
        .orchestrator
        .create_workflow(spec("wf-taken"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyExists(_)));
    // The stored workflow is still reachable
    assert_eq!(
        second.orchestrator.state(&wf("wf-taken")).await.unwrap().state,
        State::TokenCreated
    );
}

#[tokio::test]
async fn file_backed_orchestrator_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = OrchestratorConfig::ephemeral();
    config.wal.data_dir = Some(dir.path().to_path_buf());
    let workflow_id = wf("wf-disk");

    {
        let orchestrator = Orchestrator::builder(config.clone())
            .engine(Arc::new(ScriptedEngine::new(plan())))
            .policy(allow_all())
            .build()
            .unwrap();
        orchestrator.create_workflow(spec("wf-disk")).await.unwrap();
        orchestrator
            .run_flight_plan(&workflow_id, EngineCredentials::none())
            .await
            .unwrap();
        orchestrator.create_plan_token(&workflow_id).await.unwrap();
        orchestrator.run_preflight(&workflow_id, Vec::new()).await.unwrap();
        orchestrator.mark_ready(&workflow_id).await.unwrap();
        orchestrator.wal().sync().await.unwrap();
    }

    let orchestrator = Orchestrator::builder(config)
        .engine(Arc::new(ScriptedEngine::new(plan())))
        .policy(allow_all())
        .build()
        .unwrap();
    let report = orchestrator.recover().await.unwrap();
    assert_eq!(report.recovered[0].state, State::ReadyForTakeoff);

    let record = orchestrator
        .take_off(&workflow_id, TakeoffCommand::new())
        .await
        .unwrap();
    assert_eq!(record.current_state, State::Completed);
}

#[tokio::test]
async fn interrupted_flight_plan_is_resumed() {
    let first = Harness::new();
    first.engine.delay(Duration::from_secs(3600));
    let workflow_id = wf("wf-crash-plan");
    first
        .orchestrator
        .create_workflow(spec("wf-crash-plan"))
        .await
        .unwrap();

    let orchestrator = first.orchestrator.clone();
    let id = workflow_id.clone();
    let task = tokio::spawn(async move {
        orchestrator
            .run_flight_plan(&id, EngineCredentials::none())
            .await
    });
    wait_for_engine(&first.engine, 1).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let second = restart(&first);
    let report = second.orchestrator.recover().await.unwrap();
    assert_eq!(report.recovered[0].state, State::PlanRunning);

    let state = second
        .orchestrator
        .run_flight_plan(&workflow_id, EngineCredentials::none())
        .await
        .unwrap();
    assert_eq!(state.state, State::PlanGenerated);

    let entries = second.orchestrator.wal_entries(&workflow_id).await.unwrap();
    let runs: Vec<u64> = entries
        .iter()
        .filter_map(|e| match &e.data {
            WalEntryData::StepStarted(StepStartedData { run_index, .. }) => Some(*run_index),
            _ => None,
        })
        .collect();
    assert_eq!(runs, vec![1, 2]);

    let calls = second.engine.calls();
    assert_eq!(calls[0].orchestrator.as_ref().unwrap().run_index, Some(2));
    // Only the resumed run's artifacts are bound
    let token = second.orchestrator.create_plan_token(&workflow_id).await.unwrap();
    assert_eq!(token.artifacts.len(), 2);
}

#[tokio::test]
async fn interrupted_takeoff_must_be_failed_by_an_operator() {
    let first = Harness::new();
    let (workflow_id, _) = first.ready("wf-crash-takeoff").await;
    first.engine.delay(Duration::from_secs(3600));

    let orchestrator = first.orchestrator.clone();
    let id = workflow_id.clone();
    let task = tokio::spawn(async move { orchestrator.take_off(&id, TakeoffCommand::new()).await });
    wait_for_engine(&first.engine, 2).await;
    task.abort();
    let _ = task.await;

    let second = restart(&first);
    second.orchestrator.recover().await.unwrap();
    assert_eq!(
        second.orchestrator.state(&workflow_id).await.unwrap().state,
        State::TakeoffRunning
    );
    let err = second
        .orchestrator
        .take_off(&workflow_id, TakeoffCommand::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);

    let state = second
        .orchestrator
        .fail(&workflow_id, ErrorKind::EngineFailure, "take-off interrupted")
        .await
        .unwrap();
    assert_eq!(state.state, State::Failed);
}

#[tokio::test]
async fn interrupted_denial_is_completed_on_recovery() {
    let first = Harness::new();
    let (workflow_id, _) = first.plan("wf-half-denied").await;

    // The process died between logging the decision and failing the workflow.
    let wal = first.orchestrator.wal();
    wal.append(
        &workflow_id,
        WalEntryData::StepStarted(StepStartedData {
            step_id: cabincrew_orchestrator::step_id(StepKind::Preflight),
            step_type: StepKind::Preflight,
            run_index: 0,
            plan_token_check: None,
        }),
    )
    .await
    .unwrap();
    wal.append(
        &workflow_id,
        WalEntryData::PolicyEvaluated(PolicyEvaluatedData {
            evaluation_id: "eval-1".into(),
            step_id: cabincrew_orchestrator::step_id(StepKind::Preflight),
            policy_name: "preflight:most_restrictive".into(),
            method: AggregationMethod::MostRestrictive,
            decision: Decision::Deny,
            reason: Some("public bucket".into()),
            violations: vec!["public bucket".into()],
            warnings: Vec::new(),
            requires: None,
            evaluations: Vec::new(),
        }),
    )
    .await
    .unwrap();

    let second = restart(&first);
    let report = second.orchestrator.recover().await.unwrap();
    assert_eq!(report.recovered[0].state, State::Failed);

    let entries = second.orchestrator.wal_entries(&workflow_id).await.unwrap();
    match &entries.last().unwrap().data {
        WalEntryData::WorkflowFailed(failed) => {
            assert_eq!(failed.kind, ErrorKind::PolicyDenied);
            assert_eq!(failed.error, "public bucket");
        }
        other => panic!("unexpected last entry: {other:?}"),
    }
}

#[tokio::test]
async fn logged_deny_holds_after_a_lazy_reload() {
    let first = Harness::builder()
        .policy(deny_all("public bucket"))
        .build();
    let (workflow_id, _) = first.plan("wf-lazy-deny").await;
    // The deny is logged, its workflow_failed is not
    first.faults.fail_syncs_after(2);
    first
        .orchestrator
        .run_preflight(&workflow_id, Vec::new())
        .await
        .unwrap_err();

    // The restarted orchestrator only allows, and never calls recover()
    let second = restart(&first);
    let err = second
        .orchestrator
        .run_preflight(&workflow_id, Vec::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TerminalState);
    assert_eq!(
        second.orchestrator.state(&workflow_id).await.unwrap().state,
        State::Failed
    );

    let entries = second.orchestrator.wal_entries(&workflow_id).await.unwrap();
    let decisions: Vec<Decision> = entries
        .iter()
        .filter_map(|e| match &e.data {
            WalEntryData::PolicyEvaluated(p) => Some(p.decision),
            _ => None,
        })
        .collect();
    assert_eq!(decisions, vec![Decision::Deny]);
    match &entries.last().unwrap().data {
        WalEntryData::WorkflowFailed(failed) => assert_eq!(failed.kind, ErrorKind::PolicyDenied),
        other => panic!("unexpected last entry: {other:?}"),
    }
}

#[tokio::test]
async fn logged_approval_denial_holds_after_a_lazy_reload() {
    let first = Harness::builder()
        .policy(require_approval("sre-lead"))
        .build();
    let (workflow_id, _) = first.plan("wf-lazy-denial").await;
    first
        .orchestrator
        .run_preflight(&workflow_id, Vec::new())
        .await
        .unwrap();
    let request = first
        .orchestrator
        .request_approval(&workflow_id, Vec::new())
        .await
        .unwrap();
    let denial = ApprovalResponse::deny(request.approval_id, "bob", "change freeze");
    first.faults.fail_syncs_after(1);
    first
        .orchestrator
        .receive_approval(&workflow_id, denial)
        .await
        .unwrap_err();

    let second = restart(&first);
    assert_eq!(
        second.orchestrator.state(&workflow_id).await.unwrap().state,
        State::Failed
    );
    let err = second.orchestrator.mark_ready(&workflow_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TerminalState);
    let types = second.entry_types(&workflow_id).await;
    assert_eq!(
        &types[types.len() - 2..],
        &["approval_received".to_string(), "workflow_failed".to_string()]
    );
}

#[tokio::test]
async fn corrupted_log_is_quarantined() {
    let first = Harness::new();
    let (bad, _) = first.plan("wf-bitrot").await;
    let (good, _) = first.plan("wf-healthy").await;

    let mut bytes = first.storage.segment_bytes(&bad, 1).unwrap();
    let at = bytes.len() - 10;
    bytes[at] ^= 0x20;
    first.storage.set_segment_bytes(&bad, 1, bytes).unwrap();

    let second = restart(&first);
    let report = second.orchestrator.recover().await.unwrap();
    assert_eq!(report.recovered.len(), 1);
    assert_eq!(report.recovered[0].workflow_id, good);
    assert_eq!(report.quarantined.len(), 1);
    assert_eq!(report.quarantined[0].workflow_id, bad);

    let err = second
        .orchestrator
        .run_preflight(&bad, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Quarantined { .. }));
    assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
    assert!(second.orchestrator.quarantine_reason(&bad).is_some());

    // The healthy workflow is unaffected
    second
        .orchestrator
        .run_preflight(&good, Vec::new())
        .await
        .unwrap();
}
