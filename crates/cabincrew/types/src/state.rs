use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::ids::{StepId, WorkflowId};
use crate::policy::Decision;

/// Workflow protocol state.
///
/// `INIT` is the only initial state. `COMPLETED` and `FAILED` are the only
/// terminal states, and `FAILED` is reachable from every non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Init,
    PlanRunning,
    PlanGenerated,
    TokenCreated,
    PreFlightRunning,
    PreflightComplete,
    AwaitingApproval,
    Approved,
    ReadyForTakeoff,
    TakeoffRunning,
    ArtifactsValidated,
    ExecutionComplete,
    Completed,
    Failed,
}

impl State {
    pub const ALL: [State; 14] = [
        State::Init,
        State::PlanRunning,
        State::PlanGenerated,
        State::TokenCreated,
        State::PreFlightRunning,
        State::PreflightComplete,
        State::AwaitingApproval,
        State::Approved,
        State::ReadyForTakeoff,
        State::TakeoffRunning,
        State::ArtifactsValidated,
        State::ExecutionComplete,
        State::Completed,
        State::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }

    /// Forward edges out of this state, excluding the implicit edge to `FAILED`.
    pub fn successors(&self) -> &'static [State] {
        match self {
            State::Init => &[State::PlanRunning],
            State::PlanRunning => &[State::PlanGenerated],
            State::PlanGenerated => &[State::TokenCreated],
            State::TokenCreated => &[State::PreFlightRunning],
            State::PreFlightRunning => &[State::PreflightComplete, State::AwaitingApproval],
            State::PreflightComplete => &[State::ReadyForTakeoff],
            State::AwaitingApproval => &[State::Approved],
            State::Approved => &[State::ReadyForTakeoff],
            State::ReadyForTakeoff => &[State::TakeoffRunning],
            State::TakeoffRunning => &[State::ArtifactsValidated],
            State::ArtifactsValidated => &[State::ExecutionComplete],
            State::ExecutionComplete => &[State::Completed],
            State::Completed | State::Failed => &[],
        }
    }

    /// Whether `self -> target` is a legal edge.
    pub fn can_transition_to(&self, target: State) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == State::Failed || self.successors().contains(&target)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Init => "INIT",
            State::PlanRunning => "PLAN_RUNNING",
            State::PlanGenerated => "PLAN_GENERATED",
            State::TokenCreated => "TOKEN_CREATED",
            State::PreFlightRunning => "PRE_FLIGHT_RUNNING",
            State::PreflightComplete => "PREFLIGHT_COMPLETE",
            State::AwaitingApproval => "AWAITING_APPROVAL",
            State::Approved => "APPROVED",
            State::ReadyForTakeoff => "READY_FOR_TAKEOFF",
            State::TakeoffRunning => "TAKEOFF_RUNNING",
            State::ArtifactsValidated => "ARTIFACTS_VALIDATED",
            State::ExecutionComplete => "EXECUTION_COMPLETE",
            State::Completed => "COMPLETED",
            State::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned to callers after every command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub state: State,
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<Decision>,
}
