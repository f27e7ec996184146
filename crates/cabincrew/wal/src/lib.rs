//! CabinCrew write-ahead log.
//!
//! The WAL is the only source of truth for workflow recovery. Every workflow
//! gets its own append-only journal whose sequences start at 1 and never skip.
//! Each entry carries a SHA-256 checksum over its canonical form, and each
//! on-disk frame adds a CRC32 so torn writes are told apart from tampering:
//!
//! - a partial frame at the end of the last segment is an append that never
//!   returned; it is cut off when the workflow's log is opened
//! - a complete frame that fails its CRC or checksum is corruption, and the
//!   workflow's log refuses to open
//!
//! Replay is a lazy, forward-only iterator that always starts at sequence 1.

#![deny(unsafe_code)]

pub mod error;
mod frame;
pub mod log;
pub mod replay;
pub mod report;
pub mod storage;

pub use error::{Result, WalError};
pub use log::{SegmentMeta, SyncMode, WalConfig, WriteAheadLog};
pub use replay::Replay;
pub use report::IntegrityReport;
pub use storage::{FileStorage, MemoryStorage, SegmentReader, SegmentWriter, WalStorage};
