//! # CabinCrew Orchestrator
//!
//! Drives a workflow through the two-phase protocol:
//!
//! ```text
//! INIT -> PLAN_RUNNING -> PLAN_GENERATED -> TOKEN_CREATED -> PRE_FLIGHT_RUNNING
//!      -> (PREFLIGHT_COMPLETE | AWAITING_APPROVAL -> APPROVED) -> READY_FOR_TAKEOFF
//!      -> TAKEOFF_RUNNING -> ARTIFACTS_VALIDATED -> EXECUTION_COMPLETE -> COMPLETED
//! ```
//!
//! Any non-terminal state may move to `FAILED`.
//!
//! Each transition is appended to the workflow's WAL before it takes effect,
//! and recovery rebuilds every workflow by folding its entries through the
//! same transition table the live path uses. The engine runs as an untrusted
//! subprocess; its take-off artifacts must match the plan token bound during
//! flight-plan.

#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod machine;
pub mod orchestrator;

pub use config::{
    EngineConfig, IntegrityConfig, LoggingConfig, OrchestratorConfig, PolicyConfig, WalSettings,
};
pub use engine::{Engine, EngineCredentials, EngineError, SubprocessEngine};
pub use error::{OrchestratorError, Result};
pub use machine::{step_id, TransitionError, WorkflowSnapshot, STEP_ORDER};
pub use orchestrator::{
    IntegrityOverride, Orchestrator, OrchestratorBuilder, QuarantinedWorkflow, RecoveredWorkflow,
    RecoveryReport, TakeoffCommand, WorkflowSpec,
};
