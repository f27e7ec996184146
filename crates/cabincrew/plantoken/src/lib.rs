//! Plan tokens bind a flight-plan's artifacts, workspace and engine identity
//! to the take-off that later applies them.
//!
//! A token is built exactly once per workflow. Before take-off the presented
//! plan is re-verified against the bound hash, and after take-off the engine's
//! artifacts are matched against the planned ones.

#![deny(unsafe_code)]

mod builder;
mod error;
mod verify;

pub use builder::{compute_token, PlanTokenBuilder};
pub use error::PlanTokenError;
pub use verify::{
    diff, validate_takeoff_artifacts, verify, verify_plan, ArtifactValidation, Verification,
};
