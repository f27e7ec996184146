//! CabinCrew protocol types.
//!
//! The orchestrator runs an untrusted engine in two phases: a flight-plan that
//! proposes artifacts and a take-off that applies them. This crate holds the
//! vocabulary every other crate shares:
//! - Workflow [`State`] and the legal transition edges between states
//! - [`PlanToken`] and the per-artifact hashes it binds
//! - [`WalEntry`] and the typed payload of every entry type
//! - Policy [`Decision`]s, evaluations and preflight boundary types
//! - Engine, approval, gateway and audit wire shapes
//! - The deterministic hasher/canonicalizer in [`hash`]
//!
//! Open-ended metadata is modelled with the closed [`Value`] type. Only the
//! opaque pass-through fields (engine config, secrets, gateway payloads) stay
//! as raw `serde_json::Value` blobs.

#![deny(unsafe_code)]

pub mod approval;
pub mod artifact;
pub mod audit;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod hash;
pub mod ids;
pub mod plan;
pub mod policy;
pub mod record;
pub mod state;
pub mod value;
pub mod wal;

pub use approval::{ApprovalRecord, ApprovalRequest, ApprovalResponse};
pub use artifact::Artifact;
pub use audit::{
    AuditApproval, AuditArtifact, AuditEngine, AuditEvent, AuditGateway, AuditIntegrity,
    AuditPolicy, AuditSeverity, AuditWorkflow,
};
pub use engine::{
    EngineArtifact, EngineInput, EngineMeta, EngineMetric, EngineMode, EngineOrchestrator,
    EngineOutput, EngineStatus, Secrets,
};
pub use error::{ErrorKind, HashError};
pub use gateway::{
    GatewayApproval, GatewayKind, GatewayRequest, GatewayResponse, LlmGatewayRequest,
    McpGatewayRequest,
};
pub use hash::{canonicalize, canonicalize_bytes, hash, hash_artifacts, hash_canonical, ContentHash};
pub use ids::{ApprovalId, IdError, StepId, WorkflowId};
pub use plan::{PlanArtifactHash, PlanToken, PLAN_TOKEN_VERSION};
pub use policy::{
    AggregationMethod, Decision, PolicyEvaluation, PolicyEvaluationRecord, PolicySource,
    PreflightEvidence, PreflightInput, PreflightOutput, PreflightRequires,
};
pub use record::{ArtifactRecord, WorkflowStateRecord};
pub use state::{State, WorkflowState};
pub use value::{Metadata, Value};
pub use wal::{
    ApprovalReceivedData, ApprovalRequestedData, ArtifactCreatedData, IntegrityOverrideData,
    PlanTokenCheck, PolicyEvaluatedData, StepCompletedData, StepKind, StepOutcome,
    StepStartedData, WalEntry, WalEntryData, WalEntryType, WorkflowCompletedData,
    WorkflowFailedData, WorkflowStartedData,
};
