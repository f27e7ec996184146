//! Hash chain over emitted audit events
//!
//! `chain_hash(n) = hash(chain_hash(n-1), content_hash(event_n))`, where the
//! content hash covers the event with `chain_hash` and `signature` cleared.
//! The chain head is state owned by one sink.

use cabincrew_types::{hash_canonical, AuditEvent, ContentHash, HashError};
use serde::{Deserialize, Serialize};

use crate::error::{AuditError, Result};

/// Digest of an event's content, independent of its place in a chain.
pub fn content_hash(event: &AuditEvent) -> std::result::Result<ContentHash, HashError> {
    let mut unchained = event.clone();
    unchained.chain_hash = None;
    unchained.signature = None;
    hash_canonical(&unchained)
}

/// One link of the chain.
pub fn link(
    previous: Option<&ContentHash>,
    content: &ContentHash,
) -> std::result::Result<ContentHash, HashError> {
    hash_canonical(&(previous, content))
}

/// Running chain state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditChain {
    head: Option<ContentHash>,
    event_count: u64,
}

impl AuditChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a stored head
    pub fn from_state(head: Option<ContentHash>, event_count: u64) -> Self {
        Self { head, event_count }
    }

    /// Current chain head
    pub fn head(&self) -> Option<&ContentHash> {
        self.head.as_ref()
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Stamp `event` with the next chain hash and advance.
    pub fn append(&mut self, mut event: AuditEvent) -> Result<AuditEvent> {
        let content = content_hash(&event)?;
        let next = link(self.head.as_ref(), &content)?;
        event.chain_hash = Some(next.to_string());
        self.head = Some(next);
        self.event_count += 1;
        Ok(event)
    }

    /// Rebuild state from already-chained events, checking every link.
    pub fn resume(events: &[AuditEvent]) -> Result<Self> {
        let verification = verify_chain(events)?;
        if !verification.valid {
            return Err(AuditError::Chain(
                verification
                    .error_message
                    .unwrap_or_else(|| "broken chain".to_string()),
            ));
        }
        let head = match events.last().and_then(|e| e.chain_hash.clone()) {
            Some(hex) => Some(ContentHash::from_hex(hex)?),
            None => None,
        };
        Ok(Self::from_state(head, events.len() as u64))
    }
}

/// Result of verifying a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub total_events: usize,
    pub verified_events: usize,
    pub first_invalid_index: Option<usize>,
    pub error_message: Option<String>,
}

/// Recompute every link from the start of `events`.
pub fn verify_chain(events: &[AuditEvent]) -> Result<ChainVerification> {
    let mut result = ChainVerification {
        valid: true,
        total_events: events.len(),
        verified_events: 0,
        first_invalid_index: None,
        error_message: None,
    };

    let mut previous: Option<ContentHash> = None;
    for (i, event) in events.iter().enumerate() {
        let expected = link(previous.as_ref(), &content_hash(event)?)?;
        if event.chain_hash.as_deref() != Some(expected.as_str()) {
            result.valid = false;
            result.first_invalid_index = Some(i);
            result.error_message = Some(format!(
                "event {} has chain hash {:?}, expected {}",
                event.event_id, event.chain_hash, expected
            ));
            return Ok(result);
        }
        previous = Some(expected);
        result.verified_events = i + 1;
    }

    Ok(result)
}
