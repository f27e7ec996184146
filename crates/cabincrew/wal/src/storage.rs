//! Segment storage backends.
//!
//! Each workflow owns an independent set of numbered segments. The log layer
//! never touches the filesystem directly; it goes through [`WalStorage`].

use std::collections::BTreeMap;
use std::io::{BufReader, Read, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cabincrew_types::WorkflowId;
use tracing::debug;

use crate::error::{Result, WalError};

/// Storage backend for per-workflow segments.
pub trait WalStorage: Send + Sync {
    /// Workflows that have at least one segment.
    fn list_workflows(&self) -> Result<Vec<WorkflowId>>;
    /// Segment ids of one workflow, ascending.
    fn list_segments(&self, workflow_id: &WorkflowId) -> Result<Vec<u64>>;
    /// Create a new segment, truncating any existing one with the same id.
    fn create_segment(&self, workflow_id: &WorkflowId, segment_id: u64)
        -> Result<Box<dyn SegmentWriter>>;
    /// Open an existing segment for appending.
    fn append_segment(&self, workflow_id: &WorkflowId, segment_id: u64)
        -> Result<Box<dyn SegmentWriter>>;
    fn open_segment(&self, workflow_id: &WorkflowId, segment_id: u64)
        -> Result<Box<dyn SegmentReader>>;
    /// Cut a segment back to `len` bytes.
    fn truncate_segment(&self, workflow_id: &WorkflowId, segment_id: u64, len: u64) -> Result<()>;
    fn remove_segment(&self, workflow_id: &WorkflowId, segment_id: u64) -> Result<()>;
    /// Move every segment of a workflow out of the live set into `dest`.
    fn archive_workflow(&self, workflow_id: &WorkflowId, dest: &Path) -> Result<()>;
}

pub trait SegmentWriter: Send + Sync {
    fn write_all(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    /// Durable once this returns.
    fn sync(&mut self) -> Result<()>;
    fn position(&self) -> u64;
}

pub trait SegmentReader: Send {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    fn position(&self) -> u64;
    fn len(&self) -> u64;
}

pub(crate) fn segment_file_name(segment_id: u64) -> String {
    format!("wal-{segment_id:016x}.seg")
}

fn parse_segment_file_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("wal-")?.strip_suffix(".seg")?;
    u64::from_str_radix(hex, 16).ok()
}

// ---- File-backed storage ----

/// Segments under `data_dir/<workflow_id>/wal-<id>.seg`.
pub struct FileStorage {
    data_dir: PathBuf,
}

impl FileStorage {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn workflow_dir(&self, workflow_id: &WorkflowId) -> PathBuf {
        self.data_dir.join(workflow_id.as_str())
    }

    fn segment_path(&self, workflow_id: &WorkflowId, segment_id: u64) -> PathBuf {
        self.workflow_dir(workflow_id)
            .join(segment_file_name(segment_id))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

impl WalStorage for FileStorage {
    fn list_workflows(&self) -> Result<Vec<WorkflowId>> {
        let mut workflows = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match WorkflowId::new(name) {
                Ok(id) => {
                    if !self.list_segments(&id)?.is_empty() {
                        workflows.push(id);
                    }
                }
                Err(e) => debug!(error = %e, "Skipping non-workflow directory"),
            }
        }
        workflows.sort();
        Ok(workflows)
    }

    fn list_segments(&self, workflow_id: &WorkflowId) -> Result<Vec<u64>> {
        let dir = self.workflow_dir(workflow_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(id) = parse_segment_file_name(&entry.file_name().to_string_lossy()) {
                segments.push(id);
            }
        }
        segments.sort_unstable();
        Ok(segments)
    }

    fn create_segment(
        &self,
        workflow_id: &WorkflowId,
        segment_id: u64,
    ) -> Result<Box<dyn SegmentWriter>> {
        let dir = self.workflow_dir(workflow_id);
        let new_dir = !dir.exists();
        std::fs::create_dir_all(&dir)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.segment_path(workflow_id, segment_id))?;
        sync_dir(&dir)?;
        // The workflow directory's own entry lives in data_dir
        if new_dir {
            debug!(workflow_id = %workflow_id, dir = %dir.display(), "Workflow directory created");
            sync_dir(&self.data_dir)?;
        }
        Ok(Box::new(FileSegmentWriter { file, position: 0 }))
    }

    fn append_segment(
        &self,
        workflow_id: &WorkflowId,
        segment_id: u64,
    ) -> Result<Box<dyn SegmentWriter>> {
        let path = self.segment_path(workflow_id, segment_id);
        if !path.exists() {
            return Err(WalError::SegmentNotFound {
                workflow_id: workflow_id.clone(),
                segment_id,
            });
        }
        let file = std::fs::OpenOptions::new().append(true).open(&path)?;
        let position = file.metadata()?.len();
        Ok(Box::new(FileSegmentWriter { file, position }))
    }

    fn open_segment(
        &self,
        workflow_id: &WorkflowId,
        segment_id: u64,
    ) -> Result<Box<dyn SegmentReader>> {
        let path = self.segment_path(workflow_id, segment_id);
        let file = std::fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => WalError::SegmentNotFound {
                workflow_id: workflow_id.clone(),
                segment_id,
            },
            _ => WalError::Io(e),
        })?;
        let len = file.metadata()?.len();
        Ok(Box::new(FileSegmentReader {
            reader: BufReader::new(file),
            position: 0,
            len,
        }))
    }

    fn truncate_segment(&self, workflow_id: &WorkflowId, segment_id: u64, len: u64) -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.segment_path(workflow_id, segment_id))?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }

    fn remove_segment(&self, workflow_id: &WorkflowId, segment_id: u64) -> Result<()> {
        std::fs::remove_file(self.segment_path(workflow_id, segment_id))?;
        Ok(())
    }

    fn archive_workflow(&self, workflow_id: &WorkflowId, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        std::fs::rename(self.workflow_dir(workflow_id), dest.join(workflow_id.as_str()))?;
        sync_dir(&self.data_dir)?;
        Ok(())
    }
}

struct FileSegmentWriter {
    file: std::fs::File,
    position: u64,
}

impl SegmentWriter for FileSegmentWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}

struct FileSegmentReader {
    reader: BufReader<std::fs::File>,
    position: u64,
    len: u64,
}

impl SegmentReader for FileSegmentReader {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn len(&self) -> u64 {
        self.len
    }
}

// ---- In-memory storage ----

type SegmentMap = BTreeMap<WorkflowId, BTreeMap<u64, Vec<u8>>>;

/// In-memory storage for tests and ephemeral orchestrators.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    segments: Arc<Mutex<SegmentMap>>,
    archived: Arc<Mutex<SegmentMap>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workflows moved out by [`WalStorage::archive_workflow`].
    pub fn archived_workflows(&self) -> Result<Vec<WorkflowId>> {
        let archived = self.archived.lock().map_err(|_| WalError::LockPoisoned)?;
        Ok(archived.keys().cloned().collect())
    }

    /// Raw bytes of one segment.
    pub fn segment_bytes(&self, workflow_id: &WorkflowId, segment_id: u64) -> Result<Vec<u8>> {
        let segments = self.segments.lock().map_err(|_| WalError::LockPoisoned)?;
        segments
            .get(workflow_id)
            .and_then(|s| s.get(&segment_id))
            .cloned()
            .ok_or_else(|| WalError::SegmentNotFound {
                workflow_id: workflow_id.clone(),
                segment_id,
            })
    }

    /// Overwrite one segment's bytes.
    pub fn set_segment_bytes(
        &self,
        workflow_id: &WorkflowId,
        segment_id: u64,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let mut segments = self.segments.lock().map_err(|_| WalError::LockPoisoned)?;
        segments
            .entry(workflow_id.clone())
            .or_default()
            .insert(segment_id, bytes);
        Ok(())
    }
}

impl WalStorage for MemoryStorage {
    fn list_workflows(&self) -> Result<Vec<WorkflowId>> {
        let segments = self.segments.lock().map_err(|_| WalError::LockPoisoned)?;
        Ok(segments
            .iter()
            .filter(|(_, segs)| !segs.is_empty())
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn list_segments(&self, workflow_id: &WorkflowId) -> Result<Vec<u64>> {
        let segments = self.segments.lock().map_err(|_| WalError::LockPoisoned)?;
        Ok(segments
            .get(workflow_id)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default())
    }

    fn create_segment(
        &self,
        workflow_id: &WorkflowId,
        segment_id: u64,
    ) -> Result<Box<dyn SegmentWriter>> {
        let mut segments = self.segments.lock().map_err(|_| WalError::LockPoisoned)?;
        segments
            .entry(workflow_id.clone())
            .or_default()
            .insert(segment_id, Vec::new());
        Ok(Box::new(MemorySegmentWriter {
            segments: Arc::clone(&self.segments),
            workflow_id: workflow_id.clone(),
            segment_id,
            position: 0,
        }))
    }

    fn append_segment(
        &self,
        workflow_id: &WorkflowId,
        segment_id: u64,
    ) -> Result<Box<dyn SegmentWriter>> {
        let position = self.segment_bytes(workflow_id, segment_id)?.len() as u64;
        Ok(Box::new(MemorySegmentWriter {
            segments: Arc::clone(&self.segments),
            workflow_id: workflow_id.clone(),
            segment_id,
            position,
        }))
    }

    fn open_segment(
        &self,
        workflow_id: &WorkflowId,
        segment_id: u64,
    ) -> Result<Box<dyn SegmentReader>> {
        let data = self.segment_bytes(workflow_id, segment_id)?;
        Ok(Box::new(MemorySegmentReader { data, position: 0 }))
    }

    fn truncate_segment(&self, workflow_id: &WorkflowId, segment_id: u64, len: u64) -> Result<()> {
        let mut segments = self.segments.lock().map_err(|_| WalError::LockPoisoned)?;
        let data = segments
            .get_mut(workflow_id)
            .and_then(|s| s.get_mut(&segment_id))
            .ok_or_else(|| WalError::SegmentNotFound {
                workflow_id: workflow_id.clone(),
                segment_id,
            })?;
        data.truncate(len as usize);
        Ok(())
    }

    fn remove_segment(&self, workflow_id: &WorkflowId, segment_id: u64) -> Result<()> {
        let mut segments = self.segments.lock().map_err(|_| WalError::LockPoisoned)?;
        if let Some(segs) = segments.get_mut(workflow_id) {
            segs.remove(&segment_id);
        }
        Ok(())
    }

    fn archive_workflow(&self, workflow_id: &WorkflowId, _dest: &Path) -> Result<()> {
        let moved = {
            let mut segments = self.segments.lock().map_err(|_| WalError::LockPoisoned)?;
            segments.remove(workflow_id).unwrap_or_default()
        };
        let mut archived = self.archived.lock().map_err(|_| WalError::LockPoisoned)?;
        archived.insert(workflow_id.clone(), moved);
        Ok(())
    }
}

struct MemorySegmentWriter {
    segments: Arc<Mutex<SegmentMap>>,
    workflow_id: WorkflowId,
    segment_id: u64,
    position: u64,
}

impl SegmentWriter for MemorySegmentWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut segments = self.segments.lock().map_err(|_| WalError::LockPoisoned)?;
        let segment = segments
            .get_mut(&self.workflow_id)
            .and_then(|s| s.get_mut(&self.segment_id))
            .ok_or_else(|| WalError::SegmentNotFound {
                workflow_id: self.workflow_id.clone(),
                segment_id: self.segment_id,
            })?;
        segment.extend_from_slice(data);
        self.position += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }
}

struct MemorySegmentReader {
    data: Vec<u8>,
    position: usize,
}

impl SegmentReader for MemorySegmentReader {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let end = self.position + buf.len();
        let src = self.data.get(self.position..end).ok_or_else(|| {
            WalError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of memory segment",
            ))
        })?;
        buf.copy_from_slice(src);
        self.position = end;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf(id: &str) -> WorkflowId {
        WorkflowId::new(id).unwrap()
    }

    #[test]
    fn segment_file_names_round_trip() {
        assert_eq!(segment_file_name(26), "wal-000000000000001a.seg");
        assert_eq!(parse_segment_file_name("wal-000000000000001a.seg"), Some(26));
        assert_eq!(parse_segment_file_name("notes.txt"), None);
    }

    #[test]
    fn memory_writer_is_visible_to_readers() {
        let storage = MemoryStorage::new();
        let id = wf("wf-a");
        let mut writer = storage.create_segment(&id, 1).unwrap();
        writer.write_all(b"abcdef").unwrap();
        assert_eq!(writer.position(), 6);

        let mut reader = storage.open_segment(&id, 1).unwrap();
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(reader.len(), 6);

        storage.truncate_segment(&id, 1, 2).unwrap();
        assert_eq!(storage.segment_bytes(&id, 1).unwrap(), b"ab".to_vec());
    }

    #[test]
    fn file_storage_lists_workflows_with_segments() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();
        let mut writer = storage.create_segment(&wf("wf-b"), 1).unwrap();
        writer.write_all(b"x").unwrap();
        writer.sync().unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        std::fs::create_dir_all(dir.path().join(".hidden")).unwrap();

        assert_eq!(storage.list_workflows().unwrap(), vec![wf("wf-b")]);
        assert_eq!(storage.list_segments(&wf("wf-b")).unwrap(), vec![1]);
    }

    #[test]
    fn file_storage_first_segment_creates_the_workflow_directory() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("wal");
        let storage = FileStorage::new(data_dir.clone()).unwrap();
        let id = wf("fresh");

        let mut writer = storage.create_segment(&id, 1).unwrap();
        writer.write_all(b"x").unwrap();
        writer.sync().unwrap();
        drop(writer);
        // Second segment goes into the existing directory
        storage.create_segment(&id, 2).unwrap();

        let reopened = FileStorage::new(data_dir).unwrap();
        assert_eq!(reopened.list_workflows().unwrap(), vec![id.clone()]);
        assert_eq!(reopened.list_segments(&id).unwrap(), vec![1, 2]);
    }

    #[test]
    fn file_storage_archive_moves_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();
        storage.create_segment(&wf("done"), 1).unwrap();

        storage.archive_workflow(&wf("done"), archive.path()).unwrap();
        assert!(storage.list_workflows().unwrap().is_empty());
        assert!(archive.path().join("done").join(segment_file_name(1)).exists());
    }
}
