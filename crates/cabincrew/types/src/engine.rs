//! Engine boundary: the request/response pair exchanged with the untrusted
//! engine subprocess.

use serde::{Deserialize, Serialize};

use crate::ids::{StepId, WorkflowId};
use crate::value::Metadata;

/// Execution phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineMode {
    #[serde(rename = "flight-plan")]
    FlightPlan,
    #[serde(rename = "take-off")]
    TakeOff,
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::FlightPlan => "flight-plan",
            EngineMode::TakeOff => "take-off",
        }
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Success,
    Failure,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Success => "success",
            EngineStatus::Failure => "failure",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMeta {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
}

/// Orchestrator-provided execution context.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOrchestrator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_salt: Option<String>,
}

/// Opaque secret material forwarded to the engine.
///
/// `Debug` never prints the contents.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secrets(serde_json::Value);

impl Secrets {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secrets([REDACTED])")
    }
}

/// Request written to the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineInput {
    pub protocol_version: String,
    pub mode: EngineMode,
    pub meta: EngineMeta,
    /// Opaque engine configuration, forwarded verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<Secrets>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<Secrets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<EngineOrchestrator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_plan_token: Option<String>,
}

/// Artifact reported by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineArtifact {
    pub name: String,
    pub role: String,
    pub path: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineMetric {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Metadata>,
}

/// Response read back from the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub protocol_version: String,
    pub engine_id: String,
    pub mode: EngineMode,
    pub receipt_id: String,
    pub status: EngineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,
    #[serde(default)]
    pub artifacts: Vec<EngineArtifact>,
    #[serde(default)]
    pub metrics: Vec<EngineMetric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token: Option<String>,
}

impl EngineOutput {
    pub fn is_success(&self) -> bool {
        self.status == EngineStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secrets_debug_is_redacted() {
        let secrets = Secrets::new(json!({"token": "hunter2"}));
        let printed = format!("{secrets:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!secrets.is_empty());
        assert!(Secrets::default().is_empty());
    }

    #[test]
    fn mode_uses_hyphenated_names() {
        assert_eq!(
            serde_json::to_string(&EngineMode::FlightPlan).unwrap(),
            "\"flight-plan\""
        );
        let mode: EngineMode = serde_json::from_str("\"take-off\"").unwrap();
        assert_eq!(mode, EngineMode::TakeOff);
    }

    #[test]
    fn output_parses_with_optional_fields_missing() {
        let raw = json!({
            "protocol_version": "1",
            "engine_id": "tf",
            "mode": "flight-plan",
            "receipt_id": "r-1",
            "status": "success",
        });
        let output: EngineOutput = serde_json::from_value(raw).unwrap();
        assert!(output.is_success());
        assert!(output.artifacts.is_empty());
    }
}
