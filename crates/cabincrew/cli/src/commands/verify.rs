//! Log integrity verification

use anyhow::bail;
use cabincrew_types::WorkflowId;
use cabincrew_wal::{IntegrityReport, WriteAheadLog};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_error, print_output, print_single, print_success, OutputFormat};

#[derive(Debug, Serialize, Tabled)]
struct ReportRow {
    #[tabled(rename = "Workflow")]
    workflow_id: String,
    #[tabled(rename = "Entries")]
    total_entries: u64,
    #[tabled(rename = "Verified")]
    verified_entries: u64,
    #[tabled(rename = "Corrupted")]
    corrupted: String,
    #[tabled(rename = "Gaps")]
    gaps: String,
    #[tabled(rename = "Torn tail")]
    torn_tail: bool,
}

impl From<&IntegrityReport> for ReportRow {
    fn from(report: &IntegrityReport) -> Self {
        let corrupted = report
            .corrupted_sequences
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>();
        let gaps = report
            .gaps
            .iter()
            .map(|(expected, found)| format!("{expected}->{found}"))
            .collect::<Vec<_>>();
        Self {
            workflow_id: report.workflow_id.to_string(),
            total_entries: report.total_entries,
            verified_entries: report.verified_entries,
            corrupted: if corrupted.is_empty() { "-".into() } else { corrupted.join(",") },
            gaps: if gaps.is_empty() { "-".into() } else { gaps.join(",") },
            torn_tail: report.torn_tail,
        }
    }
}

/// Verify one workflow, or every workflow in the directory.
///
/// Returns whether every checked log is clean.
pub fn execute(
    wal: &WriteAheadLog,
    workflow_id: Option<&WorkflowId>,
    format: OutputFormat,
) -> anyhow::Result<bool> {
    let workflows = wal.workflows()?;
    let targets = match workflow_id {
        Some(id) if !workflows.contains(id) => bail!("workflow {id} not found"),
        Some(id) => vec![id.clone()],
        None => workflows,
    };

    let reports = targets
        .iter()
        .map(|id| wal.verify_integrity(id))
        .collect::<Result<Vec<_>, _>>()?;
    let corrupted: Vec<&IntegrityReport> = reports.iter().filter(|r| !r.is_clean()).collect();

    match format {
        OutputFormat::Json => print_single(&reports)?,
        OutputFormat::Table => {
            print_output(reports.iter().map(ReportRow::from).collect(), format)?;
            if corrupted.is_empty() {
                print_success(&format!("{} workflow log(s) verified", reports.len()));
            }
        }
    }

    for report in &corrupted {
        tracing::error!(
            workflow_id = %report.workflow_id,
            corrupted = ?report.corrupted_sequences,
            gaps = ?report.gaps,
            "WAL integrity check failed"
        );
        print_error(&format!("{} is corrupted", report.workflow_id));
    }
    Ok(corrupted.is_empty())
}
