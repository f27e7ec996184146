use cabincrew_types::WorkflowId;
use serde::{Deserialize, Serialize};

/// Result of a full verification pass over one workflow's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub workflow_id: WorkflowId,
    pub total_entries: u64,
    pub verified_entries: u64,
    /// Sequences (from the frame header) whose CRC, decoding or checksum failed.
    pub corrupted_sequences: Vec<u64>,
    /// `(expected, found)` pairs where the sequence skipped or repeated.
    pub gaps: Vec<(u64, u64)>,
    /// An incomplete frame ends the last segment. It is discarded on open.
    pub torn_tail: bool,
    pub segments_checked: u32,
    pub last_sequence: u64,
}

impl IntegrityReport {
    pub(crate) fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            total_entries: 0,
            verified_entries: 0,
            corrupted_sequences: Vec::new(),
            gaps: Vec::new(),
            torn_tail: false,
            segments_checked: 0,
            last_sequence: 0,
        }
    }

    /// No corrupted entries and no gaps. A torn tail is not corruption.
    pub fn is_clean(&self) -> bool {
        self.corrupted_sequences.is_empty() && self.gaps.is_empty()
    }
}
