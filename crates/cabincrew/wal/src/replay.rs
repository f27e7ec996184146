use std::collections::VecDeque;
use std::sync::Arc;

use cabincrew_types::{WalEntry, WorkflowId};

use crate::error::{Result, WalError};
use crate::frame::{corruption, decode_frame, next_frame, read_segment_header, FrameRead, HeaderRead};
use crate::storage::{SegmentReader, WalStorage};

/// Lazy, forward-only iterator over one workflow's entries.
///
/// Yields entries in ascending sequence starting at 1, up to the last entry
/// committed when the replay was opened. Reading starts over only by opening
/// a new replay. The first error ends the iteration.
pub struct Replay {
    storage: Arc<dyn WalStorage>,
    workflow_id: WorkflowId,
    pending: VecDeque<u64>,
    current: Option<(u64, Box<dyn SegmentReader>)>,
    next_sequence: u64,
    last_sequence: u64,
    done: bool,
}

impl Replay {
    pub(crate) fn new(
        storage: Arc<dyn WalStorage>,
        workflow_id: WorkflowId,
        segments: Vec<u64>,
        last_sequence: u64,
    ) -> Self {
        Self {
            storage,
            workflow_id,
            pending: segments.into(),
            current: None,
            next_sequence: 1,
            last_sequence,
            done: false,
        }
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// Sequence of the last entry this replay will yield.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    fn fail(&mut self, error: WalError) -> Option<Result<WalEntry>> {
        self.done = true;
        self.current = None;
        Some(Err(error))
    }

    fn open_next_segment(&mut self) -> Result<bool> {
        let Some(segment_id) = self.pending.pop_front() else {
            return Ok(false);
        };
        let mut reader = self.storage.open_segment(&self.workflow_id, segment_id)?;
        match read_segment_header(&mut *reader, &self.workflow_id, segment_id)? {
            HeaderRead::Valid => self.current = Some((segment_id, reader)),
            HeaderRead::Short => self.current = None,
        }
        Ok(true)
    }
}

impl Iterator for Replay {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.next_sequence > self.last_sequence {
                self.done = true;
                return None;
            }

            if self.current.is_none() {
                match self.open_next_segment() {
                    Ok(true) => continue,
                    Ok(false) => {
                        // Segments ran out before the committed range did.
                        let error = WalError::SequenceGap {
                            workflow_id: self.workflow_id.clone(),
                            expected: self.next_sequence,
                            found: 0,
                        };
                        return self.fail(error);
                    }
                    Err(e) => return self.fail(e),
                }
            }
            let Some((segment_id, reader)) = self.current.as_mut() else {
                continue;
            };
            let segment_id = *segment_id;

            match next_frame(&mut **reader) {
                Ok(FrameRead::End) => {
                    self.current = None;
                }
                Ok(FrameRead::Torn { offset }) => {
                    let error = corruption(
                        &self.workflow_id,
                        segment_id,
                        offset,
                        "truncated frame inside committed range",
                    );
                    return self.fail(error);
                }
                Ok(FrameRead::Frame(frame)) => {
                    let entry = match decode_frame(&self.workflow_id, segment_id, &frame) {
                        Ok(entry) => entry,
                        Err(e) => return self.fail(e),
                    };
                    if entry.sequence != self.next_sequence {
                        let error = WalError::SequenceGap {
                            workflow_id: self.workflow_id.clone(),
                            expected: self.next_sequence,
                            found: entry.sequence,
                        };
                        return self.fail(error);
                    }
                    self.next_sequence += 1;
                    return Some(Ok(entry));
                }
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl std::iter::FusedIterator for Replay {}
