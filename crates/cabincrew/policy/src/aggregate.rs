//! Combining many policy evaluations into one decision

use std::collections::HashSet;
use std::sync::Arc;

use cabincrew_types::{
    AggregationMethod, AuditPolicy, Decision, PolicyEvaluation, PreflightRequires, State,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PolicyError, Result};

/// Role asked to approve when no evaluation names one.
pub const DEFAULT_APPROVAL_ROLE: &str = "approver";

/// Pluggable strategy behind [`AggregationMethod::Custom`].
pub trait CustomAggregation: Send + Sync + std::fmt::Debug {
    /// Strategy name, recorded in errors and logs
    fn name(&self) -> &str;

    /// Decide over a non-empty list of evaluations
    fn aggregate(&self, evaluations: &[PolicyEvaluation]) -> Result<Decision>;
}

/// Result of aggregation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedDecision {
    pub decision: Decision,
    pub method: AggregationMethod,
    /// Union of every evaluation's violations, first occurrence first
    pub violations: Vec<String>,
    /// Union of every evaluation's warnings, first occurrence first
    pub warnings: Vec<String>,
    /// Set only when `decision` is `require_approval`
    pub requires: Option<PreflightRequires>,
    pub evaluations: Vec<PolicyEvaluation>,
}

impl AggregatedDecision {
    pub fn is_denied(&self) -> bool {
        self.decision == Decision::Deny
    }

    /// Audit record for this decision, taken in `state`.
    pub fn to_audit(&self, state: State) -> AuditPolicy {
        let engine = match self.evaluations.as_slice() {
            [only] => Some(only.policy_id.clone()),
            _ => None,
        };
        AuditPolicy {
            aggregation_method: Some(self.method),
            decision: Some(self.decision),
            policy_evaluations: self.evaluations.clone(),
            violations: self.violations.clone(),
            warnings: self.warnings.clone(),
            engine,
            workflow_state: Some(state),
        }
    }
}

/// Policy aggregator
#[derive(Debug, Clone)]
pub struct Aggregator {
    method: AggregationMethod,
    default_role: String,
    custom: Option<Arc<dyn CustomAggregation>>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(AggregationMethod::default())
    }
}

impl Aggregator {
    pub fn new(method: AggregationMethod) -> Self {
        Self {
            method,
            default_role: DEFAULT_APPROVAL_ROLE.to_string(),
            custom: None,
        }
    }

    /// Set the role used when an approval-demanding policy names none
    pub fn with_default_role(mut self, role: impl Into<String>) -> Self {
        self.default_role = role.into();
        self
    }

    /// Register the strategy used by [`AggregationMethod::Custom`]
    pub fn with_custom_strategy(mut self, strategy: Arc<dyn CustomAggregation>) -> Self {
        self.custom = Some(strategy);
        self
    }

    pub fn method(&self) -> AggregationMethod {
        self.method
    }

    /// Combine `evaluations` into one decision.
    ///
    /// An empty list yields `allow`: with no policy configured nothing is
    /// blocked, and configuring policies is the caller's job.
    pub fn aggregate(&self, evaluations: Vec<PolicyEvaluation>) -> Result<AggregatedDecision> {
        let custom = match (self.method, &self.custom) {
            (AggregationMethod::Custom, None) => return Err(PolicyError::CustomStrategyMissing),
            (AggregationMethod::Custom, Some(strategy)) => Some(strategy),
            _ => None,
        };
        for evaluation in &evaluations {
            if Decision::from_severity(evaluation.severity).is_none() {
                return Err(PolicyError::MalformedSeverity {
                    policy_id: evaluation.policy_id.clone(),
                    severity: evaluation.severity,
                });
            }
        }

        let decision = if evaluations.is_empty() {
            Decision::Allow
        } else {
            match (self.method, custom) {
                (AggregationMethod::Custom, Some(strategy)) => strategy.aggregate(&evaluations)?,
                (AggregationMethod::AnyDeny, _) => any_deny(&evaluations),
                (AggregationMethod::AllAllow, _) => all_allow(&evaluations),
                (AggregationMethod::Unanimous, _) => unanimous(&evaluations),
                (AggregationMethod::Majority, _) => majority(&evaluations),
                _ => most_restrictive_decision(evaluations.iter()),
            }
        };

        let requires =
            (decision == Decision::RequireApproval).then(|| self.requires_for(&evaluations));
        let violations = merge(evaluations.iter().map(|e| &e.violations));
        let warnings = merge(evaluations.iter().map(|e| &e.warnings));

        debug!(
            method = %self.method,
            evaluations = evaluations.len(),
            decision = %decision,
            "Policies aggregated"
        );

        Ok(AggregatedDecision {
            decision,
            method: self.method,
            violations,
            warnings,
            requires,
            evaluations,
        })
    }

    /// Approval demand taken from the highest-severity evaluation that asked
    /// for one. When none did, the method itself escalated.
    fn requires_for(&self, evaluations: &[PolicyEvaluation]) -> PreflightRequires {
        let demanding = evaluations
            .iter()
            .filter(|e| e.decision == Decision::RequireApproval || e.requires.is_some())
            .fold(None::<&PolicyEvaluation>, |best, e| match best {
                Some(b) if b.severity >= e.severity => Some(b),
                _ => Some(e),
            });

        match demanding {
            Some(evaluation) => {
                let requires = evaluation.requires.clone().unwrap_or_default();
                PreflightRequires {
                    role: requires.role.or_else(|| Some(self.default_role.clone())),
                    reason: requires
                        .reason
                        .or_else(|| evaluation.reason.clone())
                        .or_else(|| Some(format!("approval required by {}", evaluation.policy_id))),
                }
            }
            None => PreflightRequires {
                role: Some(self.default_role.clone()),
                reason: Some(format!("{} aggregation escalated to approval", self.method)),
            },
        }
    }
}

/// Highest decision, first seen on ties.
fn most_restrictive<'a>(
    evaluations: impl Iterator<Item = &'a PolicyEvaluation>,
) -> Option<&'a PolicyEvaluation> {
    let mut best: Option<&PolicyEvaluation> = None;
    for evaluation in evaluations {
        if best.map_or(true, |b| evaluation.decision > b.decision) {
            best = Some(evaluation);
        }
    }
    best
}

fn most_restrictive_decision<'a>(
    evaluations: impl Iterator<Item = &'a PolicyEvaluation>,
) -> Decision {
    most_restrictive(evaluations)
        .map(|e| e.decision)
        .unwrap_or(Decision::Allow)
}

fn any_deny(evaluations: &[PolicyEvaluation]) -> Decision {
    if evaluations.iter().any(|e| e.decision == Decision::Deny) {
        Decision::Deny
    } else {
        most_restrictive_decision(evaluations.iter())
    }
}

fn all_allow(evaluations: &[PolicyEvaluation]) -> Decision {
    most_restrictive_decision(evaluations.iter().filter(|e| e.decision != Decision::Allow))
}

fn unanimous(evaluations: &[PolicyEvaluation]) -> Decision {
    let first = evaluations[0].decision;
    if evaluations.iter().all(|e| e.decision == first) {
        first
    } else {
        Decision::RequireApproval
    }
}

fn majority(evaluations: &[PolicyEvaluation]) -> Decision {
    let mut counts = [0usize; 4];
    for evaluation in evaluations {
        counts[usize::from(evaluation.decision.severity())] += 1;
    }
    evaluations
        .iter()
        .map(|e| e.decision)
        .find(|d| counts[usize::from(d.severity())] * 2 > evaluations.len())
        .unwrap_or_else(|| most_restrictive_decision(evaluations.iter()))
}

fn merge<'a>(lists: impl Iterator<Item = &'a Vec<String>>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for item in lists.flatten() {
        if seen.insert(item.as_str()) {
            merged.push(item.clone());
        }
    }
    merged
}
