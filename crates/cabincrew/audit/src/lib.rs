//! # CabinCrew Audit
//!
//! Every committed workflow transition produces an
//! [`AuditEvent`](cabincrew_types::AuditEvent). The orchestrator builds the
//! event from the WAL entry and hands it to an [`AuditSink`]; the sink owns
//! the hash chain linking each event to the one before it.
//!
//! Sinks:
//! - [`MemoryAuditSink`]: keeps events in memory, for tests
//! - [`TracingAuditSink`]: logs events through `tracing`
//! - [`FileAuditSink`]: append-only JSON lines, resumable

#![deny(unsafe_code)]

pub mod chain;
pub mod error;
pub mod event;
pub mod sink;

pub use chain::{content_hash, verify_chain, AuditChain, ChainVerification};
pub use error::{AuditError, Result};
pub use event::{event_for_entry, AuditEventBuilder};
pub use sink::{AuditSink, FileAuditSink, MemoryAuditSink, TracingAuditSink};
