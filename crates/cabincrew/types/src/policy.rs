//! Policy decisions, per-evaluator results and the preflight boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{EngineMode, EngineOutput};
use crate::ids::{StepId, WorkflowId};
use crate::plan::PlanToken;
use crate::value::Metadata;

/// Policy verdict, ordered by increasing restrictiveness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Warn,
    RequireApproval,
    Deny,
}

impl Decision {
    /// 0=allow, 1=warn, 2=require_approval, 3=deny
    pub fn severity(&self) -> u8 {
        match self {
            Decision::Allow => 0,
            Decision::Warn => 1,
            Decision::RequireApproval => 2,
            Decision::Deny => 3,
        }
    }

    pub fn from_severity(severity: u8) -> Option<Self> {
        match severity {
            0 => Some(Decision::Allow),
            1 => Some(Decision::Warn),
            2 => Some(Decision::RequireApproval),
            3 => Some(Decision::Deny),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Warn => "warn",
            Decision::RequireApproval => "require_approval",
            Decision::Deny => "deny",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How several policy decisions combine into one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    #[default]
    MostRestrictive,
    AnyDeny,
    AllAllow,
    Unanimous,
    Majority,
    Custom,
}

impl std::fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregationMethod::MostRestrictive => "most_restrictive",
            AggregationMethod::AnyDeny => "any_deny",
            AggregationMethod::AllAllow => "all_allow",
            AggregationMethod::Unanimous => "unanimous",
            AggregationMethod::Majority => "majority",
            AggregationMethod::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Kind of evaluator that produced a decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Opa,
    Onnx,
    LlmGateway,
    McpGateway,
    Custom,
}

/// Approval demanded by a policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightRequires {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Named, hashed artifact supporting a decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightEvidence {
    pub name: String,
    pub path: String,
    pub hash: String,
}

/// Input handed to every policy evaluator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreflightInput {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub mode: EngineMode,
    pub engine_output: EngineOutput,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<PreflightEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token: Option<PlanToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Metadata>,
}

/// Output of a single policy evaluator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreflightOutput {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<PreflightRequires>,
    #[serde(default)]
    pub violations: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl PreflightOutput {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            requires: None,
            violations: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// One evaluator's decision, input to aggregation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub policy_id: String,
    pub source: PolicySource,
    pub decision: Decision,
    /// 0..=3, same scale as [`Decision::severity`].
    pub severity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Metadata>,
    pub evaluated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<PreflightRequires>,
}

impl PolicyEvaluation {
    /// Evaluation whose severity matches its decision.
    pub fn new(policy_id: impl Into<String>, source: PolicySource, decision: Decision) -> Self {
        Self {
            policy_id: policy_id.into(),
            source,
            decision,
            severity: decision.severity(),
            reason: None,
            evidence: None,
            evaluated_at: Utc::now(),
            violations: Vec::new(),
            warnings: Vec::new(),
            requires: None,
        }
    }

    pub fn from_preflight(
        policy_id: impl Into<String>,
        source: PolicySource,
        output: PreflightOutput,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        let reason = output.requires.as_ref().and_then(|r| r.reason.clone());
        Self {
            policy_id: policy_id.into(),
            source,
            decision: output.decision,
            severity: output.decision.severity(),
            reason,
            evidence: None,
            evaluated_at,
            violations: output.violations,
            warnings: output.warnings,
            requires: output.requires,
        }
    }

    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_violation(mut self, violation: impl Into<String>) -> Self {
        self.violations.push(violation.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_requires(mut self, role: impl Into<String>, reason: impl Into<String>) -> Self {
        self.requires = Some(PreflightRequires {
            role: Some(role.into()),
            reason: Some(reason.into()),
        });
        self
    }
}

/// Durable form of a policy evaluation, kept in the workflow record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluationRecord {
    pub evaluation_id: String,
    pub step_id: StepId,
    pub policy_name: String,
    pub decision: Decision,
    pub evaluated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_hashes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_order_by_severity() {
        assert!(Decision::Allow < Decision::Warn);
        assert!(Decision::Warn < Decision::RequireApproval);
        assert!(Decision::RequireApproval < Decision::Deny);
        for s in 0..=3 {
            assert_eq!(Decision::from_severity(s).unwrap().severity(), s);
        }
        assert!(Decision::from_severity(4).is_none());
    }

    #[test]
    fn wire_names() {
        assert_eq!(
            serde_json::to_string(&Decision::RequireApproval).unwrap(),
            "\"require_approval\""
        );
        assert_eq!(
            serde_json::to_string(&PolicySource::LlmGateway).unwrap(),
            "\"llm_gateway\""
        );
        assert_eq!(
            serde_json::to_string(&AggregationMethod::AllAllow).unwrap(),
            "\"all_allow\""
        );
        assert_eq!(AggregationMethod::default(), AggregationMethod::MostRestrictive);
    }

    #[test]
    fn from_preflight_carries_requires_reason() {
        let output = PreflightOutput {
            decision: Decision::RequireApproval,
            requires: Some(PreflightRequires {
                role: Some("sre".into()),
                reason: Some("touches prod".into()),
            }),
            violations: vec![],
            warnings: vec!["large diff".into()],
        };
        let eval = PolicyEvaluation::from_preflight("opa.prod", PolicySource::Opa, output, Utc::now());
        assert_eq!(eval.severity, 2);
        assert_eq!(eval.reason.as_deref(), Some("touches prod"));
        assert_eq!(eval.warnings, vec!["large diff".to_string()]);
    }
}
