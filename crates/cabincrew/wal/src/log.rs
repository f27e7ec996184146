use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cabincrew_types::{WalEntry, WalEntryData, WorkflowId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, WalError};
use crate::frame::{
    corruption, decode_frame, encode_frame, next_frame, read_segment_header, write_segment_header,
    FrameRead, HeaderRead, SEGMENT_HEADER_SIZE,
};
use crate::replay::Replay;
use crate::report::IntegrityReport;
use crate::storage::{FileStorage, MemoryStorage, SegmentWriter, WalStorage};

/// Sync mode for the WAL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// fsync after every append. `append` returns only once the entry is durable.
    #[default]
    Immediate,
    /// fsync every `batch_size` appends and on [`WriteAheadLog::sync`].
    Batched,
    /// No explicit fsync, relies on the OS.
    OsManaged,
}

/// WAL configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Maximum segment size before rotation (default: 64MB)
    pub max_segment_size: u64,
    pub sync_mode: SyncMode,
    /// Appends between fsyncs in batched mode (default: 64)
    pub batch_size: u32,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 64 * 1024 * 1024,
            sync_mode: SyncMode::Immediate,
            batch_size: 64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SegmentMeta {
    pub id: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub size_bytes: u64,
    pub entry_count: u64,
}

/// Open state of one workflow's log. Guarded by a per-workflow mutex.
struct WorkflowLog {
    workflow_id: WorkflowId,
    segments: Vec<SegmentMeta>,
    writer: Option<Box<dyn SegmentWriter>>,
    last_sequence: u64,
    unsynced: u32,
    /// Opening a segment failed; rescan storage before the next append.
    needs_reload: bool,
    /// Segment and length a failed append still has to be cut back to.
    pending_truncate: Option<(u64, u64)>,
}

impl WorkflowLog {
    /// Scan and verify every segment. A torn frame at the very end of the
    /// last segment is cut off; anything else that fails to verify is fatal.
    fn load(storage: &dyn WalStorage, workflow_id: &WorkflowId) -> Result<Self> {
        let segment_ids = storage.list_segments(workflow_id)?;
        let mut segments = Vec::with_capacity(segment_ids.len());
        let mut last_sequence = 0u64;

        for (index, &segment_id) in segment_ids.iter().enumerate() {
            let is_last = index + 1 == segment_ids.len();
            let mut reader = storage.open_segment(workflow_id, segment_id)?;

            if let HeaderRead::Short = read_segment_header(&mut *reader, workflow_id, segment_id)? {
                if !is_last {
                    return Err(corruption(workflow_id, segment_id, 0, "truncated segment header"));
                }
                warn!(
                    workflow_id = %workflow_id,
                    segment_id,
                    "Removing segment with incomplete header"
                );
                storage.remove_segment(workflow_id, segment_id)?;
                continue;
            }

            let mut meta = SegmentMeta {
                id: segment_id,
                first_sequence: last_sequence + 1,
                last_sequence,
                size_bytes: SEGMENT_HEADER_SIZE,
                entry_count: 0,
            };

            loop {
                match next_frame(&mut *reader)? {
                    FrameRead::End => break,
                    FrameRead::Torn { offset } => {
                        if !is_last {
                            return Err(corruption(
                                workflow_id,
                                segment_id,
                                offset,
                                "truncated frame in sealed segment",
                            ));
                        }
                        warn!(
                            workflow_id = %workflow_id,
                            segment_id,
                            offset,
                            "Discarding torn tail frame"
                        );
                        storage.truncate_segment(workflow_id, segment_id, offset)?;
                        break;
                    }
                    FrameRead::Frame(frame) => {
                        let entry = decode_frame(workflow_id, segment_id, &frame)?;
                        if entry.sequence != last_sequence + 1 {
                            return Err(WalError::SequenceGap {
                                workflow_id: workflow_id.clone(),
                                expected: last_sequence + 1,
                                found: entry.sequence,
                            });
                        }
                        last_sequence = entry.sequence;
                        meta.last_sequence = last_sequence;
                        meta.entry_count += 1;
                        meta.size_bytes = reader.position();
                    }
                }
            }
            segments.push(meta);
        }

        Ok(Self {
            workflow_id: workflow_id.clone(),
            segments,
            writer: None,
            last_sequence,
            unsynced: 0,
            needs_reload: false,
            pending_truncate: None,
        })
    }

    fn ensure_writer(&mut self, storage: &dyn WalStorage, config: &WalConfig) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        match self.segments.last() {
            Some(last) if last.size_bytes < config.max_segment_size => {
                self.writer = Some(storage.append_segment(&self.workflow_id, last.id)?);
            }
            last => {
                let new_id = last.map(|s| s.id + 1).unwrap_or(1);
                let mut writer = storage.create_segment(&self.workflow_id, new_id)?;
                write_segment_header(&mut *writer)?;
                writer.sync()?;
                self.segments.push(SegmentMeta {
                    id: new_id,
                    first_sequence: self.last_sequence + 1,
                    last_sequence: self.last_sequence,
                    size_bytes: SEGMENT_HEADER_SIZE,
                    entry_count: 0,
                });
                if new_id > 1 {
                    info!(workflow_id = %self.workflow_id, segment_id = new_id, "WAL segment rotated");
                }
                self.writer = Some(writer);
            }
        }
        Ok(())
    }

    fn append(
        &mut self,
        storage: &dyn WalStorage,
        config: &WalConfig,
        data: WalEntryData,
    ) -> Result<WalEntry> {
        if let Some((segment_id, len)) = self.pending_truncate {
            storage.truncate_segment(&self.workflow_id, segment_id, len)?;
            self.pending_truncate = None;
        }
        if self.needs_reload {
            *self = Self::load(storage, &self.workflow_id)?;
        }

        let sequence = self.last_sequence + 1;
        let entry = WalEntry::seal(sequence, self.workflow_id.clone(), data, Utc::now())?;
        let frame = encode_frame(&entry)?;

        if let Err(e) = self.ensure_writer(storage, config) {
            self.writer = None;
            self.needs_reload = true;
            return Err(e);
        }
        let segment_id = self
            .segments
            .last()
            .map(|s| s.id)
            .ok_or_else(|| WalError::WriterUnavailable(self.workflow_id.clone()))?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| WalError::WriterUnavailable(self.workflow_id.clone()))?;

        let start = writer.position();
        // A segment is sealed by the append that fills it, so it is synced here
        let segment_full = start + frame.len() as u64 >= config.max_segment_size;
        let sync_now = segment_full
            || match config.sync_mode {
                SyncMode::Immediate => true,
                SyncMode::Batched => self.unsynced + 1 >= config.batch_size.max(1),
                SyncMode::OsManaged => false,
            };
        let written = writer.write_all(&frame).and_then(|()| {
            if sync_now {
                writer.sync()
            } else {
                writer.flush()
            }
        });
        if let Err(e) = written {
            warn!(
                workflow_id = %self.workflow_id,
                sequence,
                error = %e,
                "WAL append failed"
            );
            self.writer = None;
            self.roll_back(storage, segment_id, start);
            return Err(e);
        }

        // Nothing below may fail: the entry is committed
        self.unsynced = if sync_now { 0 } else { self.unsynced + 1 };
        self.last_sequence = sequence;
        if let Some(last) = self.segments.last_mut() {
            last.last_sequence = sequence;
            last.size_bytes = start + frame.len() as u64;
            last.entry_count += 1;
        }
        if segment_full {
            self.writer = None;
        }

        debug!(
            workflow_id = %self.workflow_id,
            sequence,
            entry_type = %entry.entry_type,
            "Entry appended to WAL"
        );
        Ok(entry)
    }

    /// Cut a failed append's bytes off the segment. If that fails too, the
    /// next append retries the cut before writing anything.
    fn roll_back(&mut self, storage: &dyn WalStorage, segment_id: u64, len: u64) {
        if let Err(e) = storage.truncate_segment(&self.workflow_id, segment_id, len) {
            warn!(
                workflow_id = %self.workflow_id,
                segment_id,
                len,
                error = %e,
                "WAL rollback failed"
            );
            self.pending_truncate = Some((segment_id, len));
        }
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.sync()?;
        }
        self.unsynced = 0;
        Ok(())
    }
}

/// Write-ahead log: one append-only, sequenced, checksummed journal per workflow.
///
/// Appends to the same workflow are serialized; appends to different
/// workflows only contend on the first access that opens a workflow's log.
pub struct WriteAheadLog {
    config: WalConfig,
    storage: Arc<dyn WalStorage>,
    logs: RwLock<HashMap<WorkflowId, Arc<Mutex<WorkflowLog>>>>,
}

impl WriteAheadLog {
    pub fn open(config: WalConfig, storage: Arc<dyn WalStorage>) -> Self {
        Self {
            config,
            storage,
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Open with file-backed storage.
    pub fn open_file(config: WalConfig, data_dir: PathBuf) -> Result<Self> {
        let storage = Arc::new(FileStorage::new(data_dir)?);
        Ok(Self::open(config, storage))
    }

    /// Open with in-memory storage.
    pub fn open_memory(config: WalConfig) -> Self {
        Self::open(config, Arc::new(MemoryStorage::new()))
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn WalStorage> {
        &self.storage
    }

    async fn log_for(&self, workflow_id: &WorkflowId) -> Result<Arc<Mutex<WorkflowLog>>> {
        if let Some(log) = self.logs.read().await.get(workflow_id) {
            return Ok(Arc::clone(log));
        }
        let mut logs = self.logs.write().await;
        if let Some(log) = logs.get(workflow_id) {
            return Ok(Arc::clone(log));
        }
        let log = WorkflowLog::load(&*self.storage, workflow_id)?;
        debug!(
            workflow_id = %workflow_id,
            segments = log.segments.len(),
            last_sequence = log.last_sequence,
            "Workflow log opened"
        );
        let log = Arc::new(Mutex::new(log));
        logs.insert(workflow_id.clone(), Arc::clone(&log));
        Ok(log)
    }

    /// Append one entry, assigning the workflow's next sequence.
    ///
    /// With [`SyncMode::Immediate`] the entry is on stable storage when this
    /// returns. On error nothing was committed.
    pub async fn append(&self, workflow_id: &WorkflowId, data: WalEntryData) -> Result<WalEntry> {
        let log = self.log_for(workflow_id).await?;
        let mut log = log.lock().await;
        log.append(&*self.storage, &self.config, data)
    }

    /// Replay a workflow from its first entry.
    ///
    /// The replay covers every entry committed before this call. An unknown
    /// workflow replays as empty.
    pub async fn replay(&self, workflow_id: &WorkflowId) -> Result<Replay> {
        let log = self.log_for(workflow_id).await?;
        let log = log.lock().await;
        let segments = log.segments.iter().map(|s| s.id).collect();
        Ok(Replay::new(
            Arc::clone(&self.storage),
            workflow_id.clone(),
            segments,
            log.last_sequence,
        ))
    }

    /// Collect a full replay.
    pub async fn entries(&self, workflow_id: &WorkflowId) -> Result<Vec<WalEntry>> {
        self.replay(workflow_id).await?.collect()
    }

    /// Recompute an entry's checksum.
    pub fn verify(entry: &WalEntry) -> bool {
        entry.verify()
    }

    pub async fn last_sequence(&self, workflow_id: &WorkflowId) -> Result<u64> {
        let log = self.log_for(workflow_id).await?;
        let log = log.lock().await;
        Ok(log.last_sequence)
    }

    /// Workflows present in storage.
    pub fn workflows(&self) -> Result<Vec<WorkflowId>> {
        self.storage.list_workflows()
    }

    /// Verify every frame of a workflow without modifying storage.
    ///
    /// Unlike replay this keeps going past bad entries so the report covers
    /// the whole log.
    pub fn verify_integrity(&self, workflow_id: &WorkflowId) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::new(workflow_id.clone());
        let segment_ids = self.storage.list_segments(workflow_id)?;

        for (index, &segment_id) in segment_ids.iter().enumerate() {
            let is_last = index + 1 == segment_ids.len();
            report.segments_checked += 1;
            let mut reader = self.storage.open_segment(workflow_id, segment_id)?;
            match read_segment_header(&mut *reader, workflow_id, segment_id) {
                Ok(HeaderRead::Valid) => {}
                Ok(HeaderRead::Short) if is_last => {
                    report.torn_tail = true;
                    continue;
                }
                Ok(HeaderRead::Short) | Err(_) => {
                    report.corrupted_sequences.push(report.last_sequence + 1);
                    continue;
                }
            }

            loop {
                match next_frame(&mut *reader)? {
                    FrameRead::End => break,
                    FrameRead::Torn { .. } => {
                        if is_last {
                            report.torn_tail = true;
                        } else {
                            report.corrupted_sequences.push(report.last_sequence + 1);
                        }
                        break;
                    }
                    FrameRead::Frame(frame) => {
                        report.total_entries += 1;
                        match decode_frame(workflow_id, segment_id, &frame) {
                            Ok(entry) => {
                                report.verified_entries += 1;
                                let expected = report.last_sequence + 1;
                                if entry.sequence != expected {
                                    report.gaps.push((expected, entry.sequence));
                                }
                                report.last_sequence = entry.sequence;
                            }
                            Err(e) => {
                                warn!(
                                    workflow_id = %workflow_id,
                                    segment_id,
                                    sequence = frame.sequence,
                                    error = %e,
                                    "Corrupted WAL entry"
                                );
                                report.corrupted_sequences.push(frame.sequence);
                                report.last_sequence = report.last_sequence.max(frame.sequence);
                            }
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// fsync every open writer.
    pub async fn sync(&self) -> Result<()> {
        let logs: Vec<_> = self.logs.read().await.values().cloned().collect();
        for log in logs {
            log.lock().await.sync()?;
        }
        Ok(())
    }

    /// Move a workflow's log out of the live set.
    pub async fn archive(&self, workflow_id: &WorkflowId, dest: &Path) -> Result<()> {
        let mut logs = self.logs.write().await;
        if let Some(log) = logs.remove(workflow_id) {
            let mut log = log.lock().await;
            log.sync()?;
            log.writer = None;
        }
        self.storage.archive_workflow(workflow_id, dest)?;
        info!(workflow_id = %workflow_id, dest = %dest.display(), "Workflow log archived");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabincrew_types::{
        State, StepCompletedData, StepId, StepKind, StepStartedData, WorkflowStartedData,
    };
    use std::io::Write;

    fn wf(id: &str) -> WorkflowId {
        WorkflowId::new(id).unwrap()
    }

    fn started() -> WalEntryData {
        WalEntryData::WorkflowStarted(WorkflowStartedData {
            step_id: StepId::new("plan"),
            initial_state: State::Init,
            engine_id: "terraform".into(),
            model: "gpt-x".into(),
            protocol_version: "1".into(),
            workspace_hash: "ws".into(),
            config: None,
            context: None,
            governance_hash: None,
            policy_digest: None,
        })
    }

    fn step(i: u64) -> WalEntryData {
        if i % 2 == 0 {
            WalEntryData::StepStarted(StepStartedData {
                step_id: StepId::new(format!("step-{i}")),
                step_type: StepKind::FlightPlan,
                run_index: i,
                plan_token_check: None,
            })
        } else {
            WalEntryData::StepCompleted(StepCompletedData {
                step_id: StepId::new(format!("step-{i}")),
                step_type: StepKind::FlightPlan,
                artifacts: vec![],
                outcome: None,
                plan_token: None,
            })
        }
    }

    fn sequences(entries: &[WalEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.sequence).collect()
    }

    /// Memory storage whose syncs and truncations can be made to fail.
    /// Writes still land, so a failed sync leaves the frame in the segment.
    #[derive(Clone, Default)]
    struct FaultyStorage {
        inner: MemoryStorage,
        faults: Arc<Faults>,
    }

    #[derive(Default)]
    struct Faults {
        syncs_left: std::sync::Mutex<Option<usize>>,
        fail_truncate: std::sync::atomic::AtomicBool,
    }

    impl Faults {
        /// Let `ok` more syncs through, then fail every one after
        fn fail_syncs_after(&self, ok: usize) {
            *self.syncs_left.lock().unwrap() = Some(ok);
        }

        fn fail_truncate(&self, fail: bool) {
            self.fail_truncate
                .store(fail, std::sync::atomic::Ordering::SeqCst);
        }

        fn heal(&self) {
            *self.syncs_left.lock().unwrap() = None;
            self.fail_truncate(false);
        }

        fn sync(&self) -> Result<()> {
            let mut left = self.syncs_left.lock().unwrap();
            match left.as_mut() {
                Some(0) => Err(WalError::Io(std::io::Error::other("disk unplugged"))),
                Some(n) => {
                    *n -= 1;
                    Ok(())
                }
                None => Ok(()),
            }
        }
    }

    struct FaultyWriter {
        inner: Box<dyn SegmentWriter>,
        faults: Arc<Faults>,
    }

    impl SegmentWriter for FaultyWriter {
        fn write_all(&mut self, data: &[u8]) -> Result<()> {
            self.inner.write_all(data)
        }

        fn flush(&mut self) -> Result<()> {
            self.inner.flush()
        }

        fn sync(&mut self) -> Result<()> {
            self.faults.sync()?;
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
        fn list_workflows(&self) -> Result<Vec<WorkflowId>> {
            self.inner.list_workflows()
        }

        fn list_segments(&self, workflow_id: &WorkflowId) -> Result<Vec<u64>> {
            self.inner.list_segments(workflow_id)
        }

        fn create_segment(
            &self,
            workflow_id: &WorkflowId,
            segment_id: u64,
        ) -> Result<Box<dyn SegmentWriter>> {
            Ok(self.wrap(self.inner.create_segment(workflow_id, segment_id)?))
        }

        fn append_segment(
            &self,
            workflow_id: &WorkflowId,
            segment_id: u64,
        ) -> Result<Box<dyn SegmentWriter>> {
            Ok(self.wrap(self.inner.append_segment(workflow_id, segment_id)?))
        }

        fn open_segment(
            &self,
            workflow_id: &WorkflowId,
            segment_id: u64,
        ) -> Result<Box<dyn crate::storage::SegmentReader>> {
            self.inner.open_segment(workflow_id, segment_id)
        }

        fn truncate_segment(&self, workflow_id: &WorkflowId, segment_id: u64, len: u64) -> Result<()> {
            if self.faults.fail_truncate.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(WalError::Io(std::io::Error::other("read-only filesystem")));
            }
            self.inner.truncate_segment(workflow_id, segment_id, len)
        }

        fn remove_segment(&self, workflow_id: &WorkflowId, segment_id: u64) -> Result<()> {
            self.inner.remove_segment(workflow_id, segment_id)
        }

        fn archive_workflow(&self, workflow_id: &WorkflowId, dest: &Path) -> Result<()> {
            self.inner.archive_workflow(workflow_id, dest)
        }
    }

    #[tokio::test]
    async fn append_and_replay_roundtrip() {
        let wal = WriteAheadLog::open_memory(WalConfig::default());
        let id = wf("wf-1");

        let entry = wal.append(&id, started()).await.unwrap();
        assert_eq!(entry.sequence, 1);
        assert!(WriteAheadLog::verify(&entry));

        let entries = wal.entries(&id).await.unwrap();
        assert_eq!(entries, vec![entry]);
    }

    #[tokio::test]
    async fn sequences_are_per_workflow() {
        let wal = WriteAheadLog::open_memory(WalConfig::default());
        for i in 0..3 {
            wal.append(&wf("a"), step(i)).await.unwrap();
        }
        wal.append(&wf("b"), started()).await.unwrap();

        assert_eq!(sequences(&wal.entries(&wf("a")).await.unwrap()), vec![1, 2, 3]);
        assert_eq!(sequences(&wal.entries(&wf("b")).await.unwrap()), vec![1]);
        assert_eq!(wal.workflows().unwrap(), vec![wf("a"), wf("b")]);
    }

    #[tokio::test]
    async fn unknown_workflow_replays_empty() {
        let wal = WriteAheadLog::open_memory(WalConfig::default());
        assert!(wal.entries(&wf("nobody")).await.unwrap().is_empty());
        assert_eq!(wal.last_sequence(&wf("nobody")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_appends_have_no_gaps() {
        let wal = Arc::new(WriteAheadLog::open_memory(WalConfig::default()));
        let id = wf("busy");
        let mut handles = Vec::new();
        for i in 0..32 {
            let wal = Arc::clone(&wal);
            let id = id.clone();
            handles.push(tokio::spawn(async move { wal.append(&id, step(i)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let entries = wal.entries(&id).await.unwrap();
        assert_eq!(sequences(&entries), (1..=32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn replay_is_bounded_by_commit_point() {
        let wal = WriteAheadLog::open_memory(WalConfig::default());
        let id = wf("bounded");
        wal.append(&id, started()).await.unwrap();
        let replay = wal.replay(&id).await.unwrap();
        wal.append(&id, step(1)).await.unwrap();

        assert_eq!(replay.last_sequence(), 1);
        assert_eq!(replay.count(), 1);
    }

    #[tokio::test]
    async fn segment_rotation_keeps_entries_readable() {
        let config = WalConfig {
            max_segment_size: 600,
            ..WalConfig::default()
        };
        let storage = Arc::new(MemoryStorage::new());
        let wal = WriteAheadLog::open(config, storage.clone());
        let id = wf("rotating");
        for i in 0..20 {
            wal.append(&id, step(i)).await.unwrap();
        }

        assert!(storage.list_segments(&id).unwrap().len() > 1);
        let entries = wal.entries(&id).await.unwrap();
        assert_eq!(sequences(&entries), (1..=20).collect::<Vec<_>>());
        assert!(wal.verify_integrity(&id).unwrap().is_clean());
    }

    #[tokio::test]
    async fn file_backed_reopen_resumes_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let id = wf("durable");
        {
            let wal = WriteAheadLog::open_file(WalConfig::default(), dir.path().to_path_buf()).unwrap();
            for i in 0..5 {
                wal.append(&id, step(i)).await.unwrap();
            }
        }

        let wal = WriteAheadLog::open_file(WalConfig::default(), dir.path().to_path_buf()).unwrap();
        assert_eq!(wal.last_sequence(&id).await.unwrap(), 5);
        let next = wal.append(&id, step(5)).await.unwrap();
        assert_eq!(next.sequence, 6);
        assert_eq!(wal.entries(&id).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn torn_tail_is_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let id = wf("torn");
        {
            let wal = WriteAheadLog::open_file(WalConfig::default(), dir.path().to_path_buf()).unwrap();
            for i in 0..3 {
                wal.append(&id, step(i)).await.unwrap();
            }
        }
        // Half a frame: a length prefix promising more bytes than follow.
        let segment = dir.path().join("torn").join("wal-0000000000000001.seg");
        let mut file = std::fs::OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(&[200, 0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0, b'{', b'"']).unwrap();
        drop(file);

        let wal = WriteAheadLog::open_file(WalConfig::default(), dir.path().to_path_buf()).unwrap();
        let report = wal.verify_integrity(&id).unwrap();
        assert!(report.torn_tail);
        assert!(report.is_clean());

        assert_eq!(wal.entries(&id).await.unwrap().len(), 3);
        assert_eq!(wal.append(&id, step(3)).await.unwrap().sequence, 4);
        assert!(!wal.verify_integrity(&id).unwrap().torn_tail);
    }

    #[tokio::test]
    async fn corrupted_frame_is_fatal() {
        let storage = Arc::new(MemoryStorage::new());
        let id = wf("bitrot");
        {
            let wal = WriteAheadLog::open(WalConfig::default(), storage.clone());
            for i in 0..3 {
                wal.append(&id, step(i)).await.unwrap();
            }
        }
        let mut bytes = storage.segment_bytes(&id, 1).unwrap();
        // Inside the last frame's JSON payload, before its CRC.
        let at = bytes.len() - 10;
        bytes[at] ^= 0x20;
        storage.set_segment_bytes(&id, 1, bytes).unwrap();

        let wal = WriteAheadLog::open(WalConfig::default(), storage.clone());
        let err = wal.entries(&id).await.unwrap_err();
        assert!(err.is_integrity_failure());
        assert_eq!(err.kind(), cabincrew_types::ErrorKind::IntegrityViolation);
        assert!(wal.append(&id, step(3)).await.is_err());

        let report = wal.verify_integrity(&id).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.corrupted_sequences, vec![3]);
        assert_eq!(report.verified_entries, 2);
    }

    #[tokio::test]
    async fn archive_removes_workflow_from_live_set() {
        let storage = Arc::new(MemoryStorage::new());
        let wal = WriteAheadLog::open(WalConfig::default(), storage.clone());
        wal.append(&wf("old"), started()).await.unwrap();
        wal.append(&wf("new"), started()).await.unwrap();

        wal.archive(&wf("old"), Path::new("archive")).await.unwrap();
        assert_eq!(wal.workflows().unwrap(), vec![wf("new")]);
        assert_eq!(storage.archived_workflows().unwrap(), vec![wf("old")]);
    }

    #[tokio::test]
    async fn batched_mode_syncs_on_request() {
        let config = WalConfig {
            sync_mode: SyncMode::Batched,
            batch_size: 4,
            ..WalConfig::default()
        };
        let wal = WriteAheadLog::open_memory(config);
        for i in 0..6 {
            wal.append(&wf("batched"), step(i)).await.unwrap();
        }
        wal.sync().await.unwrap();
        assert_eq!(wal.entries(&wf("batched")).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn failed_sync_leaves_nothing_committed() {
        let storage = FaultyStorage::default();
        let wal = WriteAheadLog::open(WalConfig::default(), Arc::new(storage.clone()));
        let id = wf("flaky");
        wal.append(&id, started()).await.unwrap();
        let before = storage.inner.segment_bytes(&id, 1).unwrap().len();

        storage.faults.fail_syncs_after(0);
        let err = wal.append(&id, step(1)).await.unwrap_err();
        assert_eq!(err.kind(), cabincrew_types::ErrorKind::StorageFailure);
        assert_eq!(wal.last_sequence(&id).await.unwrap(), 1);
        assert_eq!(storage.inner.segment_bytes(&id, 1).unwrap().len(), before);

        storage.faults.heal();
        assert_eq!(wal.append(&id, step(1)).await.unwrap().sequence, 2);
        assert_eq!(sequences(&wal.entries(&id).await.unwrap()), vec![1, 2]);
        assert!(wal.verify_integrity(&id).unwrap().is_clean());
    }

    #[tokio::test]
    async fn failed_sync_of_a_sealing_append_is_not_committed() {
        // Every append fills its segment
        let config = WalConfig {
            max_segment_size: 1,
            ..WalConfig::default()
        };
        let storage = FaultyStorage::default();
        let wal = WriteAheadLog::open(config.clone(), Arc::new(storage.clone()));
        let id = wf("sealing");
        wal.append(&id, started()).await.unwrap();

        // The new segment's header syncs, the frame does not
        storage.faults.fail_syncs_after(1);
        assert!(wal.append(&id, step(1)).await.is_err());
        assert_eq!(wal.last_sequence(&id).await.unwrap(), 1);

        storage.faults.heal();
        assert_eq!(wal.append(&id, step(1)).await.unwrap().sequence, 2);
        assert_eq!(wal.append(&id, step(2)).await.unwrap().sequence, 3);

        let reopened = WriteAheadLog::open(config, Arc::new(storage.clone()));
        assert_eq!(
            sequences(&reopened.entries(&id).await.unwrap()),
            vec![1, 2, 3]
        );
        assert!(reopened.verify_integrity(&id).unwrap().is_clean());
    }

    #[tokio::test]
    async fn failed_rollback_is_retried_before_the_next_append() {
        let storage = FaultyStorage::default();
        let wal = WriteAheadLog::open(WalConfig::default(), Arc::new(storage.clone()));
        let id = wf("stuck");
        wal.append(&id, started()).await.unwrap();

        storage.faults.fail_syncs_after(0);
        storage.faults.fail_truncate(true);
        assert!(wal.append(&id, step(1)).await.is_err());
        // The orphaned frame is past the commit point
        assert_eq!(sequences(&wal.entries(&id).await.unwrap()), vec![1]);

        storage.faults.fail_syncs_after(usize::MAX);
        assert!(wal.append(&id, step(1)).await.is_err());

        storage.faults.heal();
        assert_eq!(wal.append(&id, step(1)).await.unwrap().sequence, 2);
        let report = wal.verify_integrity(&id).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.total_entries, 2);
    }
}
