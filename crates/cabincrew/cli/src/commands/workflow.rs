//! Workflow inspection commands

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use cabincrew_orchestrator::{OrchestratorConfig, WorkflowSnapshot};
use cabincrew_types::{WalEntry, WorkflowId};
use cabincrew_wal::WriteAheadLog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{
    colorize_state, print_output, print_single, print_success, print_warning, OutputFormat,
};

/// Parse a workflow id argument.
pub fn parse_workflow_id(value: &str) -> Result<WorkflowId, String> {
    WorkflowId::new(value).map_err(|e| e.to_string())
}

/// Open the WAL directory named on the command line or in the configuration.
///
/// The directory must already exist; the CLI never creates an empty log.
pub fn open_wal(config: &OrchestratorConfig, data_dir: Option<PathBuf>) -> anyhow::Result<WriteAheadLog> {
    let dir = data_dir
        .or_else(|| config.wal.data_dir.clone())
        .context("no WAL directory: pass --data-dir or set wal.data_dir")?;
    if !dir.is_dir() {
        bail!("WAL directory {} does not exist", dir.display());
    }
    tracing::debug!(data_dir = %dir.display(), "Opening WAL");
    WriteAheadLog::open_file(config.wal.wal_config(), dir).context("failed to open WAL")
}

async fn fold(wal: &WriteAheadLog, workflow_id: &WorkflowId) -> anyhow::Result<WorkflowSnapshot> {
    let entries = wal
        .entries(workflow_id)
        .await
        .with_context(|| format!("failed to replay workflow {workflow_id}"))?;
    WorkflowSnapshot::fold(&entries)
        .with_context(|| format!("workflow {workflow_id} does not fold"))?
        .with_context(|| format!("workflow {workflow_id} not found"))
}

#[derive(Debug, Serialize, Tabled)]
struct WorkflowRow {
    #[tabled(rename = "Workflow")]
    workflow_id: String,
    #[tabled(rename = "State", display_with = "display_state")]
    state: String,
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Entries")]
    last_sequence: u64,
    #[tabled(rename = "Updated", display_with = "display_time")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[tabled(skip)]
    error: Option<String>,
}

fn display_state(state: &str) -> String {
    colorize_state(state)
}

fn display_time(time: &Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// List every workflow with its folded state.
///
/// A workflow whose log does not replay is listed as quarantined rather than
/// failing the whole listing.
pub async fn list(wal: &WriteAheadLog, format: OutputFormat) -> anyhow::Result<()> {
    let mut rows = Vec::new();
    for workflow_id in wal.workflows()? {
        let row = match fold(wal, &workflow_id).await {
            Ok(snapshot) => {
                let state = snapshot.workflow_state();
                WorkflowRow {
                    workflow_id: workflow_id.to_string(),
                    state: state.state.to_string(),
                    step: state.step_id.to_string(),
                    last_sequence: snapshot.last_sequence(),
                    updated_at: Some(snapshot.record().updated_at),
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(workflow_id = %workflow_id, error = %format!("{e:#}"), "Workflow log does not replay");
                WorkflowRow {
                    workflow_id: workflow_id.to_string(),
                    state: "QUARANTINED".to_string(),
                    step: "-".to_string(),
                    last_sequence: 0,
                    updated_at: None,
                    error: Some(format!("{e:#}")),
                }
            }
        };
        rows.push(row);
    }
    let unreadable = rows.iter().filter(|r| r.error.is_some()).count();
    print_output(rows, format)?;
    if unreadable > 0 && format == OutputFormat::Table {
        print_warning(&format!(
            "{unreadable} workflow log(s) do not replay; run `cabincrew verify` for details"
        ));
    }
    Ok(())
}

/// Print a workflow's state record as JSON.
pub async fn inspect(wal: &WriteAheadLog, workflow_id: &WorkflowId) -> anyhow::Result<()> {
    let snapshot = fold(wal, workflow_id).await?;
    print_single(&snapshot.record())
}

#[derive(Debug, Serialize, Tabled)]
struct EntryRow {
    #[tabled(rename = "Seq")]
    sequence: u64,
    #[tabled(rename = "Timestamp")]
    timestamp: String,
    #[tabled(rename = "Type")]
    entry_type: String,
    #[tabled(rename = "Checksum")]
    checksum: String,
}

impl From<&WalEntry> for EntryRow {
    fn from(entry: &WalEntry) -> Self {
        let checksum = entry.checksum.to_string();
        Self {
            sequence: entry.sequence,
            timestamp: entry.timestamp.to_rfc3339(),
            entry_type: entry.entry_type.to_string(),
            checksum: checksum.chars().take(12).collect(),
        }
    }
}

/// Print a workflow's entries. JSON output carries the full entries.
pub async fn log(wal: &WriteAheadLog, workflow_id: &WorkflowId, format: OutputFormat) -> anyhow::Result<()> {
    let entries = wal
        .entries(workflow_id)
        .await
        .with_context(|| format!("failed to replay workflow {workflow_id}"))?;
    if entries.is_empty() {
        bail!("workflow {workflow_id} not found");
    }
    match format {
        OutputFormat::Json => print_single(&entries),
        OutputFormat::Table => print_output(entries.iter().map(EntryRow::from).collect(), format),
    }
}

/// Archive a terminal workflow's log into `dest`.
pub async fn archive(wal: &WriteAheadLog, workflow_id: &WorkflowId, dest: &Path) -> anyhow::Result<()> {
    let snapshot = fold(wal, workflow_id).await?;
    if !snapshot.is_terminal() {
        bail!(
            "workflow {workflow_id} is {} and cannot be archived until it completes or fails",
            snapshot.state()
        );
    }
    wal.archive(workflow_id, dest)
        .await
        .with_context(|| format!("failed to archive workflow {workflow_id}"))?;
    print_success(&format!("Archived {workflow_id} to {}", dest.display()));
    Ok(())
}
