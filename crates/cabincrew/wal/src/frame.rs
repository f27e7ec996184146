//! Segment header and entry framing.
//!
//! Segment format: `[magic:4][version:2][reserved:2][frames...]`
//! Frame format:   `[length:4][sequence:8][entry_json:N][crc32:4]`

use cabincrew_types::{WalEntry, WorkflowId};

use crate::error::{Result, WalError};
use crate::storage::{SegmentReader, SegmentWriter};

/// WAL magic bytes: "CCWL" (CabinCrew WAL)
pub(crate) const WAL_MAGIC: [u8; 4] = *b"CCWL";
pub(crate) const WAL_VERSION: u16 = 1;
/// magic(4) + version(2) + reserved(2)
pub(crate) const SEGMENT_HEADER_SIZE: u64 = 8;
/// length(4) + sequence(8)
const FRAME_HEAD_SIZE: usize = 12;
/// length(4) + sequence(8) + crc32(4)
pub(crate) const FRAME_OVERHEAD: u64 = 16;

pub(crate) struct Frame {
    pub offset: u64,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub crc: u32,
}

pub(crate) enum FrameRead {
    Frame(Frame),
    /// Incomplete frame starting at `offset`: the append never finished.
    Torn { offset: u64 },
    End,
}

pub(crate) enum HeaderRead {
    Valid,
    /// Shorter than a header: the segment was created but never written.
    Short,
}

pub(crate) fn write_segment_header(writer: &mut dyn SegmentWriter) -> Result<()> {
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    header[..4].copy_from_slice(&WAL_MAGIC);
    header[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
    writer.write_all(&header)?;
    Ok(())
}

pub(crate) fn read_segment_header(
    reader: &mut dyn SegmentReader,
    workflow_id: &WorkflowId,
    segment_id: u64,
) -> Result<HeaderRead> {
    if reader.len() < SEGMENT_HEADER_SIZE {
        return Ok(HeaderRead::Short);
    }
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    reader.read_exact(&mut header)?;
    if header[..4] != WAL_MAGIC {
        return Err(corruption(workflow_id, segment_id, 0, "invalid segment magic"));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != WAL_VERSION {
        return Err(corruption(
            workflow_id,
            segment_id,
            4,
            format!("unsupported segment version {version}"),
        ));
    }
    Ok(HeaderRead::Valid)
}

pub(crate) fn encode_frame(entry: &WalEntry) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(entry)?;
    let length = u32::try_from(payload.len())
        .map_err(|_| WalError::Serialization("WAL entry exceeds 4 GiB".into()))?;
    let crc = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD as usize + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&entry.sequence.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

pub(crate) fn next_frame(reader: &mut dyn SegmentReader) -> Result<FrameRead> {
    let offset = reader.position();
    let remaining = reader.len().saturating_sub(offset);
    if remaining == 0 {
        return Ok(FrameRead::End);
    }
    if remaining < FRAME_OVERHEAD {
        return Ok(FrameRead::Torn { offset });
    }

    let mut head = [0u8; FRAME_HEAD_SIZE];
    reader.read_exact(&mut head)?;
    let mut length_bytes = [0u8; 4];
    length_bytes.copy_from_slice(&head[..4]);
    let mut sequence_bytes = [0u8; 8];
    sequence_bytes.copy_from_slice(&head[4..]);
    let length = u64::from(u32::from_le_bytes(length_bytes));
    let sequence = u64::from_le_bytes(sequence_bytes);

    // Zero-filled tails (preallocation, partial page writes) look like empty frames.
    if length == 0 || remaining < FRAME_OVERHEAD + length {
        return Ok(FrameRead::Torn { offset });
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;
    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;

    Ok(FrameRead::Frame(Frame {
        offset,
        sequence,
        payload,
        crc: u32::from_le_bytes(crc_bytes),
    }))
}

/// Check a frame's CRC, decode its entry and verify the entry checksum.
pub(crate) fn decode_frame(
    workflow_id: &WorkflowId,
    segment_id: u64,
    frame: &Frame,
) -> Result<WalEntry> {
    if crc32fast::hash(&frame.payload) != frame.crc {
        return Err(corruption(workflow_id, segment_id, frame.offset, "CRC mismatch"));
    }
    let entry: WalEntry = serde_json::from_slice(&frame.payload).map_err(|e| {
        corruption(
            workflow_id,
            segment_id,
            frame.offset,
            format!("undecodable entry: {e}"),
        )
    })?;
    if entry.sequence != frame.sequence {
        return Err(corruption(
            workflow_id,
            segment_id,
            frame.offset,
            format!(
                "frame sequence {} disagrees with entry sequence {}",
                frame.sequence, entry.sequence
            ),
        ));
    }
    if &entry.workflow_id != workflow_id {
        return Err(corruption(
            workflow_id,
            segment_id,
            frame.offset,
            format!("entry belongs to workflow {}", entry.workflow_id),
        ));
    }
    if !entry.verify() {
        return Err(WalError::ChecksumMismatch {
            workflow_id: workflow_id.clone(),
            sequence: entry.sequence,
        });
    }
    Ok(entry)
}

pub(crate) fn corruption(
    workflow_id: &WorkflowId,
    segment_id: u64,
    offset: u64,
    reason: impl Into<String>,
) -> WalError {
    WalError::Corruption {
        workflow_id: workflow_id.clone(),
        segment_id,
        offset,
        reason: reason.into(),
    }
}
