//! CLI command implementations

pub mod verify;
pub mod workflow;
