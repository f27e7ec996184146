//! End-to-end workflow lifecycle through the orchestrator command surface.

mod common;

use cabincrew_orchestrator::{EngineCredentials, OrchestratorError, TakeoffCommand};
use cabincrew_types::{
    Decision, EngineMode, ErrorKind, PreflightEvidence, Secrets, State, WalEntryData,
};
use common::*;
use serde_json::json;

#[tokio::test]
async fn allowed_workflow_runs_to_completion() {
    let harness = Harness::new();
    let (workflow_id, token) = harness.ready("wf-happy").await;

    let record = harness
        .orchestrator
        .take_off(&workflow_id, TakeoffCommand::new())
        .await
        .unwrap();
    assert_eq!(record.current_state, State::Completed);
    assert_eq!(record.plan_token_hash, Some(token.token.clone()));
    assert!(record.steps_pending.is_empty());
    // Two planned and two executed artifacts
    assert_eq!(record.artifacts.len(), 4);

    assert_eq!(
        harness.entry_types(&workflow_id).await,
        vec![
            "workflow_started",
            "step_started",
            "artifact_created",
            "artifact_created",
            "step_completed",
            "step_completed",
            "step_started",
            "policy_evaluated",
            "step_completed",
            "step_started",
            "artifact_created",
            "artifact_created",
            "step_completed",
            "step_completed",
            "workflow_completed",
        ]
    );
}

#[tokio::test]
async fn every_committed_entry_is_audited() {
    let harness = Harness::new();
    let (workflow_id, _) = harness.ready("wf-audited").await;
    harness
        .orchestrator
        .take_off(&workflow_id, TakeoffCommand::new())
        .await
        .unwrap();

    let entries = harness.orchestrator.wal_entries(&workflow_id).await.unwrap();
    let events = harness.audit.events();
    assert_eq!(events.len(), entries.len());

    let decided = harness.audit.events_of_type("workflow.policy_evaluated");
    assert_eq!(decided.len(), 1);
    let policy = decided[0].policy.as_ref().unwrap();
    assert_eq!(policy.decision, Some(Decision::Allow));
    assert_eq!(policy.policy_evaluations.len(), 1);
}

#[tokio::test]
async fn engine_receives_plan_binding_on_takeoff() {
    let harness = Harness::new();
    let (workflow_id, token) = harness.ready("wf-binding").await;
    harness
        .orchestrator
        .take_off(&workflow_id, TakeoffCommand::new())
        .await
        .unwrap();

    let calls = harness.engine.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].mode, EngineMode::FlightPlan);
    assert_eq!(calls[0].expected_plan_token, None);
    assert_eq!(calls[1].mode, EngineMode::TakeOff);
    assert_eq!(
        calls[1].expected_plan_token.as_deref(),
        Some(token.token.as_str())
    );
    let run = calls[1].orchestrator.as_ref().unwrap();
    assert_eq!(run.workspace_hash.as_deref(), Some("ws-5f1c"));
}

#[tokio::test]
async fn plan_token_is_stable_across_reads() {
    let harness = Harness::new();
    let (workflow_id, token) = harness.plan("wf-stable").await;
    let stored = harness.orchestrator.plan_token(&workflow_id).await.unwrap();
    assert_eq!(stored, Some(token.clone()));
    assert_eq!(token.artifacts.len(), 2);
    assert_eq!(token.engine_id, ENGINE_ID);
    assert_eq!(token.workspace_hash, "ws-5f1c");
}

#[tokio::test]
async fn secrets_reach_the_engine_but_never_the_wal() {
    let harness = Harness::new();
    let workflow_id = wf("wf-secrets");
    harness
        .orchestrator
        .create_workflow(spec("wf-secrets"))
        .await
        .unwrap();

    let credentials = EngineCredentials::none()
        .with_secrets(Secrets::new(json!({"AWS_SECRET_ACCESS_KEY": "hunter2-do-not-log"})))
        .allow_secret("AWS_SECRET_ACCESS_KEY")
        .with_identity_token(Secrets::new(json!("oidc-token-do-not-log")));
    harness
        .orchestrator
        .run_flight_plan(&workflow_id, credentials)
        .await
        .unwrap();

    let calls = harness.engine.calls();
    assert!(calls[0].secrets.is_some());
    assert!(calls[0].identity_token.is_some());

    let entries = harness.orchestrator.wal_entries(&workflow_id).await.unwrap();
    let logged = serde_json::to_string(&entries).unwrap();
    assert!(!logged.contains("hunter2-do-not-log"));
    assert!(!logged.contains("oidc-token-do-not-log"));

    let audited = serde_json::to_string(&harness.audit.events()).unwrap();
    assert!(!audited.contains("hunter2-do-not-log"));
}

#[tokio::test]
async fn preflight_sees_evidence_and_records_its_hash() {
    let harness = Harness::new();
    let (workflow_id, _) = harness.plan("wf-evidence").await;
    let evidence = vec![PreflightEvidence {
        name: "cost-report".into(),
        path: "reports/cost.json".into(),
        hash: "9f2c".into(),
    }];
    harness
        .orchestrator
        .run_preflight(&workflow_id, evidence)
        .await
        .unwrap();

    let record = harness.orchestrator.record(&workflow_id).await.unwrap();
    assert_eq!(record.current_state, State::PreflightComplete);
    // One record per policy plus the aggregate
    assert_eq!(record.policy_evaluations.len(), 2);
    assert_eq!(record.policy_evaluations[0].policy_name, "baseline");
    assert_eq!(record.policy_evaluations[0].evidence_hashes, vec!["9f2c".to_string()]);
    assert_eq!(record.policy_evaluations[1].policy_name, "preflight:most_restrictive");
}

#[tokio::test]
async fn denied_preflight_fails_the_workflow() {
    let harness = Harness::builder()
        .policy(allow_all())
        .policy(deny_all("public bucket"))
        .build();
    let (workflow_id, _) = harness.plan("wf-denied").await;

    let err = harness
        .orchestrator
        .run_preflight(&workflow_id, Vec::new())
        .await
        .unwrap_err();
    match &err {
        OrchestratorError::PolicyDenied { violations, .. } => {
            assert_eq!(violations, &vec!["public bucket".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::PolicyDenied);

    let state = harness.orchestrator.state(&workflow_id).await.unwrap();
    assert_eq!(state.state, State::Failed);
    assert_eq!(state.last_decision, Some(Decision::Deny));

    let entries = harness.orchestrator.wal_entries(&workflow_id).await.unwrap();
    match &entries.last().unwrap().data {
        WalEntryData::WorkflowFailed(failed) => {
            assert_eq!(failed.kind, ErrorKind::PolicyDenied);
            assert_eq!(failed.from_state, State::PreFlightRunning);
        }
        other => panic!("unexpected last entry: {other:?}"),
    }
}

#[tokio::test]
async fn empty_policy_set_allows() {
    let harness = Harness::builder().build();
    let (workflow_id, _) = harness.plan("wf-no-policies").await;
    let decision = harness
        .orchestrator
        .run_preflight(&workflow_id, Vec::new())
        .await
        .unwrap();
    assert_eq!(decision.decision, Decision::Allow);
}

#[tokio::test]
async fn engine_failure_fails_the_workflow() {
    let harness = Harness::new();
    harness.engine.fail_on(EngineMode::FlightPlan);
    let workflow_id = wf("wf-engine-down");
    harness
        .orchestrator
        .create_workflow(spec("wf-engine-down"))
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .run_flight_plan(&workflow_id, EngineCredentials::none())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineFailure);
    assert!(err.to_string().contains("provider rejected the request"));

    let record = harness.orchestrator.record(&workflow_id).await.unwrap();
    assert_eq!(record.current_state, State::Failed);
    assert!(record.artifacts.is_empty());
}

#[tokio::test]
async fn duplicate_artifact_names_are_an_engine_failure() {
    let engine = std::sync::Arc::new(ScriptedEngine::new(vec![
        artifact("main.tfplan", "a"),
        artifact("main.tfplan", "b"),
    ]));
    let harness = Harness::builder().policy(allow_all()).engine(engine).build();
    let workflow_id = wf("wf-dupes");
    harness
        .orchestrator
        .create_workflow(spec("wf-dupes"))
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .run_flight_plan(&workflow_id, EngineCredentials::none())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineFailure);
    assert_eq!(
        harness.orchestrator.state(&workflow_id).await.unwrap().state,
        State::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn engine_timeout_fails_the_workflow() {
    let harness = Harness::builder().policy(allow_all()).engine_timeout(5).build();
    harness.engine.delay(std::time::Duration::from_secs(60));
    let workflow_id = wf("wf-slow");
    harness
        .orchestrator
        .create_workflow(spec("wf-slow"))
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .run_flight_plan(&workflow_id, EngineCredentials::none())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineFailure);
    assert!(err.to_string().contains("did not answer"));
    assert_eq!(
        harness.orchestrator.state(&workflow_id).await.unwrap().state,
        State::Failed
    );
}

#[tokio::test]
async fn out_of_order_command_changes_nothing() {
    let harness = Harness::new();
    let workflow_id = wf("wf-early");
    harness
        .orchestrator
        .create_workflow(spec("wf-early"))
        .await
        .unwrap();

    let err = harness
        .orchestrator
        .take_off(&workflow_id, TakeoffCommand::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);

    let err = harness
        .orchestrator
        .create_plan_token(&workflow_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);

    assert_eq!(harness.entry_types(&workflow_id).await, vec!["workflow_started"]);
    assert!(harness.engine.calls().is_empty());
}

#[tokio::test]
async fn terminal_workflow_rejects_commands() {
    let harness = Harness::new();
    let (workflow_id, _) = harness.ready("wf-done").await;
    harness
        .orchestrator
        .take_off(&workflow_id, TakeoffCommand::new())
        .await
        .unwrap();
    let before = harness.entry_types(&workflow_id).await.len();

    let err = harness
        .orchestrator
        .fail(&workflow_id, ErrorKind::InvalidInput, "too late")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TerminalState);
    let err = harness.orchestrator.mark_ready(&workflow_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TerminalState);

    assert_eq!(harness.entry_types(&workflow_id).await.len(), before);
}

#[tokio::test]
async fn operator_can_fail_a_running_workflow() {
    let harness = Harness::new();
    let (workflow_id, _) = harness.plan("wf-cancel").await;

    let state = harness
        .orchestrator
        .fail(&workflow_id, ErrorKind::InvalidInput, "cancelled by operator")
        .await
        .unwrap();
    assert_eq!(state.state, State::Failed);

    let entries = harness.orchestrator.wal_entries(&workflow_id).await.unwrap();
    match &entries.last().unwrap().data {
        WalEntryData::WorkflowFailed(failed) => {
            assert_eq!(failed.error, "cancelled by operator");
            assert_eq!(failed.from_state, State::TokenCreated);
        }
        other => panic!("unexpected last entry: {other:?}"),
    }
}

#[tokio::test]
async fn workflow_ids_are_unique() {
    let harness = Harness::new();
    harness
        .orchestrator
        .create_workflow(spec("wf-once"))
        .await
        .unwrap();
    let err = harness
        .orchestrator
        .create_workflow(spec("wf-once"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyExists(_)));
}

#[tokio::test]
async fn unknown_workflow_is_not_found() {
    let harness = Harness::new();
    let err = harness.orchestrator.state(&wf("wf-ghost")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn empty_engine_id_is_invalid() {
    let harness = Harness::new();
    let mut bad = spec("wf-bad");
    bad.engine_id.clear();
    let err = harness.orchestrator.create_workflow(bad).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    // The id stays free
    harness
        .orchestrator
        .create_workflow(spec("wf-bad"))
        .await
        .unwrap();
}
