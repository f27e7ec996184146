//! End-to-end tests for the `cabincrew` binary against a real WAL directory.

use std::path::Path;

use assert_cmd::Command;
use cabincrew_types::{
    ErrorKind, State, StepId, StepKind, StepStartedData, WalEntryData, WorkflowFailedData,
    WorkflowId, WorkflowStartedData,
};
use cabincrew_wal::{WalConfig, WriteAheadLog};
use predicates::prelude::*;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn wf(id: &str) -> WorkflowId {
    WorkflowId::new(id).unwrap()
}

fn started() -> WalEntryData {
    WalEntryData::WorkflowStarted(WorkflowStartedData {
        step_id: StepId::new("init"),
        initial_state: State::Init,
        engine_id: "terraform".into(),
        model: "gpt-4o".into(),
        protocol_version: "1".into(),
        workspace_hash: "ws-5f1c".into(),
        config: None,
        context: None,
        governance_hash: None,
        policy_digest: None,
    })
}

/// One workflow mid flight-plan and one that failed.
async fn seeded() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let wal = WriteAheadLog::open_file(WalConfig::default(), dir.path().to_path_buf()).unwrap();

    let running = wf("wf-running");
    wal.append(&running, started()).await.unwrap();
    wal.append(
        &running,
        WalEntryData::StepStarted(StepStartedData {
            step_id: StepId::new("flight_plan"),
            step_type: StepKind::FlightPlan,
            run_index: 1,
            plan_token_check: None,
        }),
    )
    .await
    .unwrap();

    let failed = wf("wf-failed");
    wal.append(&failed, started()).await.unwrap();
    wal.append(
        &failed,
        WalEntryData::WorkflowFailed(WorkflowFailedData {
            error: "engine exited with status 2".into(),
            kind: ErrorKind::EngineFailure,
            from_state: State::Init,
            failed_step: None,
        }),
    )
    .await
    .unwrap();

    wal.sync().await.unwrap();
    dir
}

fn corrupt(dir: &Path, workflow_id: &str) {
    let segment = std::fs::read_dir(dir.join(workflow_id))
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|ext| ext == "seg"))
        .unwrap();
    let mut bytes = std::fs::read(&segment).unwrap();
    let at = bytes.len() - 10;
    bytes[at] ^= 0x20;
    std::fs::write(&segment, bytes).unwrap();
}

fn cabincrew() -> Command {
    let mut cmd = Command::cargo_bin("cabincrew").unwrap();
    cmd.env_remove("CABINCREW_CONFIG")
        .env_remove("CABINCREW_LOG_LEVEL")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1");
    cmd
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_shows_folded_states() {
    let dir = seeded().await;
    cabincrew()
        .args(["list", "--data-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("wf-running"))
        .stdout(predicate::str::contains("PLAN_RUNNING"))
        .stdout(predicate::str::contains("wf-failed"))
        .stdout(predicate::str::contains("FAILED"));
}

#[tokio::test]
async fn list_json_is_machine_readable() {
    let dir = seeded().await;
    let output = cabincrew()
        .args(["list", "--json", "--data-dir"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    let running = rows
        .iter()
        .find(|r| r["workflow_id"] == "wf-running")
        .unwrap();
    assert_eq!(running["state"], "PLAN_RUNNING");
    assert_eq!(running["last_sequence"], 2);
}

#[tokio::test]
async fn inspect_prints_the_state_record() {
    let dir = seeded().await;
    let output = cabincrew()
        .args(["inspect", "--data-dir"])
        .arg(dir.path())
        .arg("wf-failed")
        .output()
        .unwrap();
    assert!(output.status.success());

    let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(record["workflow_id"], "wf-failed");
    assert_eq!(record["current_state"], "FAILED");
}

#[tokio::test]
async fn inspect_unknown_workflow_fails() {
    let dir = seeded().await;
    cabincrew()
        .args(["inspect", "--data-dir"])
        .arg(dir.path())
        .arg("wf-missing")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[tokio::test]
async fn log_lists_entries_in_order() {
    let dir = seeded().await;
    cabincrew()
        .args(["log", "--data-dir"])
        .arg(dir.path())
        .arg("wf-running")
        .assert()
        .success()
        .stdout(predicate::str::contains("workflow_started"))
        .stdout(predicate::str::contains("step_started"));
}

#[tokio::test]
async fn verify_passes_on_a_clean_directory() {
    let dir = seeded().await;
    cabincrew()
        .args(["verify", "--data-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("2 workflow log(s) verified"));
}

#[tokio::test]
async fn verify_exits_non_zero_on_corruption() {
    let dir = seeded().await;
    corrupt(dir.path(), "wf-running");

    cabincrew()
        .args(["verify", "--data-dir"])
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("wf-running is corrupted"));

    // The other workflow on its own is still clean
    cabincrew()
        .args(["verify", "--data-dir"])
        .arg(dir.path())
        .arg("wf-failed")
        .assert()
        .success();
}

#[tokio::test]
async fn corrupted_workflow_is_listed_as_quarantined() {
    let dir = seeded().await;
    corrupt(dir.path(), "wf-running");

    cabincrew()
        .args(["list", "--data-dir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("QUARANTINED"))
        .stdout(predicate::str::contains("cabincrew verify"));
}

#[tokio::test]
async fn only_terminal_workflows_are_archived() {
    let dir = seeded().await;
    let dest = tempfile::tempdir().unwrap();

    cabincrew()
        .args(["archive", "--data-dir"])
        .arg(dir.path())
        .arg("wf-running")
        .arg("--dest")
        .arg(dest.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("PLAN_RUNNING"));

    cabincrew()
        .args(["archive", "--data-dir"])
        .arg(dir.path())
        .arg("wf-failed")
        .arg("--dest")
        .arg(dest.path())
        .assert()
        .success();
    assert!(!dir.path().join("wf-failed").exists());
    assert!(dest.path().join("wf-failed").exists());
}

#[test]
fn missing_directory_is_reported() {
    cabincrew()
        .args(["list", "--data-dir", "/nonexistent/cabincrew-wal"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}
