//! Audit sinks

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cabincrew_types::{AuditEvent, AuditSeverity};
use parking_lot::{Mutex, RwLock};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::chain::AuditChain;
use crate::error::Result;

/// Destination for audit events.
///
/// The sink owns the chain: `emit` stamps the event's `chain_hash` and
/// returns the chained event.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> Result<AuditEvent>;

    /// Flush any buffered events
    async fn flush(&self) -> Result<()>;

    async fn event_count(&self) -> Result<u64>;
}

/// In-memory audit sink for testing
#[derive(Default)]
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
    chain: Mutex<AuditChain>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().clone()
    }

    /// Events of one type, in emission order
    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<AuditEvent> {
        let mut chain = self.chain.lock();
        let event = chain.append(event)?;
        self.events.write().push(event.clone());
        Ok(event)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn event_count(&self) -> Result<u64> {
        Ok(self.chain.lock().event_count())
    }
}

/// Logs every event through `tracing` at a level matching its severity
#[derive(Default)]
pub struct TracingAuditSink {
    chain: Mutex<AuditChain>,
}

impl TracingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<AuditEvent> {
        let event = self.chain.lock().append(event)?;
        let workflow_id = event
            .workflow
            .as_ref()
            .and_then(|w| w.workflow_id.as_ref())
            .map(|id| id.to_string())
            .unwrap_or_default();
        let message = event.message.as_deref().unwrap_or("");
        let chain_hash = event.chain_hash.as_deref().unwrap_or("");
        match event.severity {
            AuditSeverity::Debug => {
                debug!(target: "cabincrew::audit", event_type = %event.event_type, %workflow_id, chain_hash, "{message}")
            }
            AuditSeverity::Info => {
                info!(target: "cabincrew::audit", event_type = %event.event_type, %workflow_id, chain_hash, "{message}")
            }
            AuditSeverity::Warning => {
                warn!(target: "cabincrew::audit", event_type = %event.event_type, %workflow_id, chain_hash, "{message}")
            }
            AuditSeverity::Error | AuditSeverity::Critical => {
                error!(target: "cabincrew::audit", event_type = %event.event_type, %workflow_id, chain_hash, "{message}")
            }
        }
        Ok(event)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn event_count(&self) -> Result<u64> {
        Ok(self.chain.lock().event_count())
    }
}

/// Append-only JSON-lines audit file
pub struct FileAuditSink {
    path: PathBuf,
    chain: tokio::sync::Mutex<AuditChain>,
}

impl FileAuditSink {
    /// Open or create the file, resuming the chain from its last event.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let chain = if tokio::fs::try_exists(&path).await? {
            AuditChain::resume(&Self::read_events(&path).await?)?
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            AuditChain::new()
        };

        Ok(Self {
            path,
            chain: tokio::sync::Mutex::new(chain),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all events from file
    pub async fn read_all(&self) -> Result<Vec<AuditEvent>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        Self::read_events(&self.path).await
    }

    async fn read_events(path: &Path) -> Result<Vec<AuditEvent>> {
        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<AuditEvent> {
        // Held across the write so file order matches chain order.
        let mut chain = self.chain.lock().await;
        let mut next = chain.clone();
        let event = next.append(event)?;
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        *chain = next;
        Ok(event)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn event_count(&self) -> Result<u64> {
        Ok(self.chain.lock().await.event_count())
    }
}
