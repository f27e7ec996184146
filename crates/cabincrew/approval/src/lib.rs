//! CabinCrew approval tracking.
//!
//! When the aggregated preflight decision is `require_approval`, the
//! orchestrator issues an [`ApprovalRequest`](cabincrew_types::ApprovalRequest)
//! bound to the current plan-token hash and waits. Responses referencing an
//! unknown request, or arriving after the plan changed, are rejected as
//! replays.

#![deny(unsafe_code)]

mod error;
mod tracker;

pub use error::ApprovalError;
pub use tracker::{received_data, requested_data, Acceptance, ApprovalTracker};
